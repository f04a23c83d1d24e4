//! Publish/subscribe bus
//!
//! Every publish takes two paths at once: a best-effort fan-out through the
//! broker, and a directed `xpublish` that delivers to one target per
//! subscriber group over a fresh connection and retries until each group
//! acknowledges. The retry loop for one publish is cancelled by the first
//! matching ack, by an explicit [`PubSubBus::cancel`], or by the subscriber
//! set going empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::lock::Mutex;
use mesh_runtime::SharedSpawner;
use mesh_wire::{Body, Connection, Packet, Strategy, SubscriberRecord};
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, SubscriptionHandler};
use crate::directory::Directory;
use crate::error::Result;
use crate::service::ServiceClient;

/// Delay between xpublish retry iterations.
pub const PUBSUB_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Per-process publish/subscribe bus.
#[derive(Clone)]
pub struct PubSubBus {
    inner: Arc<PubSubInner>,
}

struct PubSubInner {
    host_id: String,
    broker: Arc<dyn Broker>,
    directory: Arc<dyn Directory>,
    clients: Vec<ServiceClient>,
    spawner: SharedSpawner,
    retry_delay: Duration,
    state: Mutex<PubSubState>,
}

#[derive(Default)]
struct PubSubState {
    /// publish_id -> cancellation handle for the retry loop
    pending_publishes: HashMap<String, async_channel::Sender<()>>,
}

fn pubsub_key(service: &str, version: &str, endpoint: &str) -> String {
    format!("{}/{}/{}", service, version, endpoint)
}

impl PubSubBus {
    /// Create a bus with the default retry delay.
    pub fn new(
        host_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        directory: Arc<dyn Directory>,
        clients: Vec<ServiceClient>,
        spawner: SharedSpawner,
    ) -> Self {
        Self::with_retry_delay(host_id, broker, directory, clients, spawner, PUBSUB_RETRY_DELAY)
    }

    /// Create a bus with an explicit retry delay.
    pub fn with_retry_delay(
        host_id: impl Into<String>,
        broker: Arc<dyn Broker>,
        directory: Arc<dyn Directory>,
        clients: Vec<ServiceClient>,
        spawner: SharedSpawner,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PubSubInner {
                host_id: host_id.into(),
                broker,
                directory,
                clients,
                spawner,
                retry_delay,
                state: Mutex::new(PubSubState::default()),
            }),
        }
    }

    /// Establish the broker connection.
    pub async fn connect(&self) -> Result<()> {
        self.inner.broker.connect().await
    }

    /// Install every subscription the local clients declare: broker
    /// patterns under one handler, and the directed list at the registry.
    /// `(service, version, host, port, node_id)` identify the local
    /// instance as subscriber.
    pub async fn register_for_subscription(
        &self,
        service: &str,
        version: &str,
        host: &str,
        port: u16,
        node_id: &str,
    ) -> Result<()> {
        let mut patterns = Vec::new();
        let mut events = Vec::new();
        for client in &self.inner.clients {
            for endpoint in client.subscription_endpoints() {
                patterns.push(pubsub_key(client.name(), client.version(), endpoint));
            }
            events.extend(client.xsubscribe_events());
        }

        if !events.is_empty() {
            self.inner
                .directory
                .install_subscriptions(service, version, host, port, node_id, events)
                .await?;
        }
        if patterns.is_empty() {
            return Ok(());
        }

        let clients = self.inner.clients.clone();
        let handler: SubscriptionHandler = Arc::new(move |key, payload| {
            let clients = clients.clone();
            Box::pin(async move {
                dispatch_broker_event(&clients, &key, &payload).await;
            })
        });
        self.inner.broker.subscribe(patterns, handler).await
    }

    /// Publish on both paths. Returns the `publish_id` of the directed
    /// delivery, usable with [`PubSubBus::cancel`].
    pub async fn publish(
        &self,
        service: &str,
        version: &str,
        endpoint: &str,
        payload: Value,
    ) -> Result<String> {
        let key = pubsub_key(service, version, endpoint);
        let text = serde_json::to_string(&payload)?;
        if let Err(err) = self.inner.broker.publish(&key, &text).await {
            warn!("broker publish under {} failed: {}", key, err);
        }

        let publish_id = Uuid::new_v4().to_string();
        let (cancel_tx, cancel_rx) = async_channel::bounded(1);
        self.inner
            .state
            .lock()
            .await
            .pending_publishes
            .insert(publish_id.clone(), cancel_tx);

        let inner = self.inner.clone();
        let task_id = publish_id.clone();
        let (service, version, endpoint) = (
            service.to_string(),
            version.to_string(),
            endpoint.to_string(),
        );
        self.inner.spawner.spawn(Box::pin(async move {
            PubSubInner::xpublish(inner, task_id, service, version, endpoint, payload, cancel_rx)
                .await;
        }));

        Ok(publish_id)
    }

    /// Stop the retry loop of one in-flight publish.
    pub async fn cancel(&self, publish_id: &str) {
        // Dropping the sender wakes the loop out of its delay.
        self.inner
            .state
            .lock()
            .await
            .pending_publishes
            .remove(publish_id);
    }

    /// Number of publishes still awaiting acknowledgement.
    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.pending_publishes.len()
    }
}

/// Route one broker delivery into the matching client handler.
async fn dispatch_broker_event(clients: &[ServiceClient], key: &str, payload: &str) {
    let mut parts = key.splitn(3, '/');
    let (Some(service), Some(version), Some(endpoint)) = (parts.next(), parts.next(), parts.next())
    else {
        warn!("malformed broker key {}", key);
        return;
    };
    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!("undecodable payload under {}: {}", key, err);
            return;
        }
    };

    match clients.iter().find(|c| c.matches(service, version)) {
        Some(client) => match client.event_handler(endpoint) {
            Some(handler) => handler(value).await,
            None => warn!("no handler for {} on {}/{}", endpoint, service, version),
        },
        None => debug!("broker delivery for {}/{} matches no client", service, version),
    }
}

impl PubSubInner {
    /// One directed publish: deliver to each subscriber group, sleep, and
    /// go again until cancelled or the subscriber set empties.
    async fn xpublish(
        inner: Arc<PubSubInner>,
        publish_id: String,
        service: String,
        version: String,
        endpoint: String,
        payload: Value,
        cancel_rx: async_channel::Receiver<()>,
    ) {
        loop {
            let subscribers = match inner
                .directory
                .subscribers_for(&service, &version, &endpoint)
                .await
            {
                Ok(subscribers) => subscribers,
                Err(err) => {
                    warn!("subscriber query for {} failed: {}", publish_id, err);
                    Vec::new()
                }
            };
            if subscribers.is_empty() {
                inner
                    .state
                    .lock()
                    .await
                    .pending_publishes
                    .remove(&publish_id);
                debug!("xpublish {} has no subscribers left", publish_id);
                return;
            }

            for group in group_by_service(&subscribers) {
                let target = pick_target(&group);
                Self::deliver_to(
                    &inner,
                    target,
                    &publish_id,
                    &service,
                    &version,
                    &endpoint,
                    payload.clone(),
                )
                .await;
            }

            match mesh_runtime::timeout(inner.retry_delay, cancel_rx.recv()).await {
                Some(_) => {
                    debug!("xpublish {} cancelled", publish_id);
                    return;
                }
                None => continue,
            }
        }
    }

    /// Open a fresh connection to one target, send the publish, and leave
    /// the connection open until its ack arrives.
    async fn deliver_to(
        inner: &Arc<PubSubInner>,
        target: &SubscriberRecord,
        publish_id: &str,
        service: &str,
        version: &str,
        endpoint: &str,
        payload: Value,
    ) {
        let conn = match Connection::connect((target.host.as_str(), target.port)).await {
            Ok(conn) => conn,
            Err(err) => {
                // The next retry iteration re-attempts this group.
                warn!("xpublish connect to {} failed: {}", target.node_id, err);
                return;
            }
        };

        let mut packet = Packet::publish(publish_id, service, version, endpoint, payload);
        packet.from = Some(inner.host_id.clone());
        packet.to = Some(target.node_id.clone());
        if let Err(err) = conn.send(&packet).await {
            warn!("xpublish send to {} failed: {}", target.node_id, err);
            conn.close();
            return;
        }

        let ack_inner = inner.clone();
        let id = publish_id.to_string();
        inner.spawner.spawn(Box::pin(async move {
            Self::await_ack(ack_inner, conn, id).await;
        }));
    }

    /// Wait for the ack that matches this publish, then cancel the retry
    /// loop and close the transport.
    async fn await_ack(inner: Arc<PubSubInner>, conn: Connection, publish_id: String) {
        loop {
            match conn.recv().await {
                Ok(packet) => {
                    if let Body::Ack { request_id } = packet.body {
                        if request_id == publish_id {
                            let cancelled = inner
                                .state
                                .lock()
                                .await
                                .pending_publishes
                                .remove(&publish_id)
                                .is_some();
                            if cancelled {
                                debug!("ack received for {}", publish_id);
                            }
                            conn.close();
                            return;
                        }
                    }
                }
                Err(_) => return,
            }
        }
    }
}

/// Group subscribers by their `(service, version)`, preserving registration
/// order within and across groups.
fn group_by_service(subscribers: &[SubscriberRecord]) -> Vec<Vec<&SubscriberRecord>> {
    let mut order: Vec<(&str, &str)> = Vec::new();
    let mut groups: HashMap<(&str, &str), Vec<&SubscriberRecord>> = HashMap::new();
    for subscriber in subscribers {
        let key = (subscriber.service.as_str(), subscriber.version.as_str());
        if !groups.contains_key(&key) {
            order.push(key);
        }
        groups.entry(key).or_default().push(subscriber);
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// One target per group: the first subscriber when any declared LEADER,
/// otherwise a uniform pick.
fn pick_target<'a>(group: &[&'a SubscriberRecord]) -> &'a SubscriberRecord {
    if group.iter().any(|s| s.strategy == Strategy::Leader) {
        group[0]
    } else {
        group
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(group[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::Strategy;

    fn subscriber(service: &str, node_id: &str, strategy: Strategy) -> SubscriberRecord {
        SubscriberRecord {
            service: service.to_string(),
            version: "1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            node_id: node_id.to_string(),
            strategy,
        }
    }

    #[test]
    fn grouping_preserves_registration_order() {
        let subscribers = vec![
            subscriber("c", "n1", Strategy::Leader),
            subscriber("d", "n2", Strategy::Random),
            subscriber("c", "n3", Strategy::Random),
        ];
        let groups = group_by_service(&subscribers);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].node_id, "n1");
        assert_eq!(groups[0][1].node_id, "n3");
        assert_eq!(groups[1][0].node_id, "n2");
    }

    #[test]
    fn any_leader_in_a_group_pins_the_first_subscriber() {
        let subscribers = vec![
            subscriber("c", "n1", Strategy::Random),
            subscriber("c", "n2", Strategy::Leader),
        ];
        let groups = group_by_service(&subscribers);
        for _ in 0..32 {
            assert_eq!(pick_target(&groups[0]).node_id, "n1");
        }
    }

    #[test]
    fn random_groups_stay_within_the_group() {
        let subscribers = vec![
            subscriber("c", "n1", Strategy::Random),
            subscriber("c", "n2", Strategy::Random),
        ];
        let groups = group_by_service(&subscribers);
        for _ in 0..32 {
            let picked = pick_target(&groups[0]).node_id.clone();
            assert!(picked == "n1" || picked == "n2");
        }
    }
}
