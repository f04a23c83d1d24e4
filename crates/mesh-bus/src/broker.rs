//! Abstract broker back-end for fan-out publish/subscribe
//!
//! The production broker is an external system; the buses only depend on
//! this trait. [`MemoryBroker`] is the in-process implementation used by
//! tests and single-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::lock::Mutex;
use tracing::debug;

use crate::error::Result;

/// Handler invoked with `(key, payload)` for every matching publish.
pub type SubscriptionHandler = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fan-out broker back-end.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the broker connection.
    async fn connect(&self) -> Result<()>;

    /// Publish `payload` under `key`, best-effort.
    async fn publish(&self, key: &str, payload: &str) -> Result<()>;

    /// Install one handler for a set of key patterns.
    async fn subscribe(&self, patterns: Vec<String>, handler: SubscriptionHandler) -> Result<()>;
}

struct Subscription {
    patterns: Vec<String>,
    handler: SubscriptionHandler,
}

/// In-process broker: exact-key matching, immediate delivery.
#[derive(Default)]
pub struct MemoryBroker {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, key: &str, payload: &str) -> Result<()> {
        let handlers: Vec<SubscriptionHandler> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .filter(|s| s.patterns.iter().any(|p| p == key))
                .map(|s| s.handler.clone())
                .collect()
        };
        if handlers.is_empty() {
            debug!("no broker subscribers for {}", key);
        }
        for handler in handlers {
            handler(key.to_string(), payload.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, patterns: Vec<String>, handler: SubscriptionHandler) -> Result<()> {
        self.subscriptions
            .lock()
            .await
            .push(Subscription { patterns, handler });
        Ok(())
    }
}
