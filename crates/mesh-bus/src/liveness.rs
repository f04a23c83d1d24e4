//! Ping/pong liveness for outbound dependency links

use std::time::Duration;

use async_channel::Receiver;
use mesh_runtime::{sleep, timeout};
use mesh_wire::{Connection, Packet};
use tracing::{debug, warn};

/// Liveness knobs for dependency links.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval between pings
    pub ping_interval: Duration,
    /// How long to wait for the matching pong
    pub pong_timeout: Duration,
    /// Whether ping/pong traffic is logged
    pub ping_logs: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(15),
            ping_logs: false,
        }
    }
}

/// Why a pinger stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PingOutcome {
    /// No pong arrived within the timeout; the peer should be reconnected
    TimedOut,
    /// The link itself went away
    Closed,
}

/// Periodic prober for one outbound link. The link's driver feeds received
/// pong counts into `pongs`.
pub(crate) struct Pinger {
    conn: Connection,
    node_id: String,
    host_id: String,
    config: LivenessConfig,
    pongs: Receiver<u64>,
}

impl Pinger {
    pub(crate) fn new(
        conn: Connection,
        node_id: String,
        host_id: String,
        config: LivenessConfig,
        pongs: Receiver<u64>,
    ) -> Self {
        Self {
            conn,
            node_id,
            host_id,
            config,
            pongs,
        }
    }

    /// Ping until the peer stops answering or the link closes.
    pub(crate) async fn run(self) -> PingOutcome {
        let mut last_count = 0u64;
        loop {
            if !self.conn.is_connected() {
                return PingOutcome::Closed;
            }

            let mut ping = Packet::ping(&self.node_id);
            ping.from = Some(self.host_id.clone());
            if self.conn.send(&ping).await.is_err() {
                return PingOutcome::Closed;
            }
            if self.config.ping_logs {
                debug!("ping -> {}", self.node_id);
            }

            match timeout(self.config.pong_timeout, self.pongs.recv()).await {
                Some(Ok(count)) => {
                    if self.config.ping_logs {
                        debug!("pong <- {} (count {})", self.node_id, count);
                    }
                    if count < last_count {
                        warn!("pong count for {} went backwards", self.node_id);
                    }
                    last_count = count;
                }
                Some(Err(_)) => return PingOutcome::Closed,
                None => {
                    warn!("no pong from {} within {:?}", self.node_id, self.config.pong_timeout);
                    return PingOutcome::TimedOut;
                }
            }

            sleep(self.config.ping_interval).await;
        }
    }
}
