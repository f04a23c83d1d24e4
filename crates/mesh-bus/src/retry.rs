//! Connect-with-retry for dependency links

use std::time::{Duration, Instant};

use mesh_runtime::{sleep, timeout};
use mesh_wire::Connection;
use tracing::debug;

use crate::error::{Error, Result};

/// Retry schedule for bringing up a dependency link.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Wait before each attempt; one attempt per entry
    pub delays: Vec<Duration>,
    /// Hard deadline across all attempts
    pub overall: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: [0, 2, 2, 4]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            overall: Duration::from_secs(10),
        }
    }
}

/// Dial `host:port` under `policy`.
pub async fn connect_with_retry(host: &str, port: u16, policy: &RetryPolicy) -> Result<Connection> {
    let deadline = Instant::now() + policy.overall;

    for delay in &policy.delays {
        if !delay.is_zero() {
            // A wait that would outlive the deadline is not worth taking.
            let before_wait = deadline.saturating_duration_since(Instant::now());
            if *delay >= before_wait {
                break;
            }
            sleep(*delay).await;
        }
        let Some(remaining) = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
        else {
            break;
        };
        match timeout(remaining, Connection::connect((host, port))).await {
            Some(Ok(conn)) => return Ok(conn),
            Some(Err(err)) => debug!("connect to {}:{} failed: {}", host, port, err),
            None => break,
        }
    }

    Err(Error::ConnectTimedOut {
        host: host.to_string(),
        port,
    })
}
