//! Task spawning and timers for the mesh crates
//!
//! The library crates in this workspace are runtime-agnostic: they do their
//! I/O through `async-net` and `futures` traits, and hand any background work
//! to a [`Spawner`] injected at construction. Timers come straight from
//! `async-io`, which drives its own reactor thread and therefore works under
//! any executor.
//!
//! A `smol`-backed spawner is available behind the `smol` cargo feature and
//! is what the daemon binary and the test suites use.

#![warn(missing_docs)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, Either};
use futures::pin_mut;

/// A boxed future with no output, ready to be handed to a runtime.
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Spawns futures onto whatever executor the process runs.
pub trait Spawner: Send + Sync {
    /// Spawn a future to run in the background until completion.
    fn spawn(&self, task: BoxedTask);
}

/// Shared spawner handle passed to components at construction.
pub type SharedSpawner = Arc<dyn Spawner>;

/// Suspend the current task for `duration`.
pub async fn sleep(duration: Duration) {
    async_io::Timer::after(duration).await;
}

/// Run `fut` for at most `limit`, returning `None` on expiry.
pub async fn timeout<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    let timer = async_io::Timer::after(limit);
    pin_mut!(fut);
    pin_mut!(timer);
    match future::select(fut, timer).await {
        Either::Left((value, _)) => Some(value),
        Either::Right(_) => None,
    }
}

/// Spawner backed by smol's global executor.
#[cfg(feature = "smol")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

#[cfg(feature = "smol")]
impl Spawner for SmolSpawner {
    fn spawn(&self, task: BoxedTask) {
        smol::spawn(task).detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_waits_at_least_the_duration() {
        smol::block_on(async {
            let start = std::time::Instant::now();
            sleep(Duration::from_millis(50)).await;
            assert!(start.elapsed() >= Duration::from_millis(50));
        });
    }

    #[test]
    fn timeout_expires_on_pending_future() {
        smol::block_on(async {
            let never = future::pending::<()>();
            assert!(timeout(Duration::from_millis(20), never).await.is_none());
        });
    }

    #[test]
    fn timeout_passes_through_completed_value() {
        smol::block_on(async {
            let value = timeout(Duration::from_secs(1), async { 7 }).await;
            assert_eq!(value, Some(7));
        });
    }

    #[cfg(feature = "smol")]
    #[test]
    fn smol_spawner_runs_tasks() {
        let (tx, rx) = std::sync::mpsc::channel();
        SmolSpawner.spawn(Box::pin(async move {
            let _ = tx.send(42);
        }));
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
