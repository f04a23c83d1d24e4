//! Registry client
//!
//! Lives inside every service process. Holds the local view of resolved
//! dependency addresses (fed by `registered`/`instances` packets), resolves
//! `(service, version, entity)` to a concrete instance, and correlates
//! subscriber queries with their replies. Consumers of this client observe
//! registry pushes through the [`RegistryEvent`] channel instead of holding
//! a pointer back into the client.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_net::AsyncToSocketAddrs;
use futures::channel::oneshot;
use futures::lock::Mutex;
use mesh_wire::{
    AddressRecord, Body, Connection, EventSubscription, Packet, ServiceRef, SubscriberRecord,
    TransportKind, VendorAddresses,
};
use rustc_hash::FxHasher;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::service_key;

/// Push from the registry, surfaced to the owning bus.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// All declared dependencies are satisfied; addresses attached.
    Activated {
        /// Address lists per dependency
        vendors: Vec<VendorAddresses>,
    },
    /// A dependency instance went away.
    InstanceDown {
        /// Departed instance's service name
        service: String,
        /// Departed instance's service version
        version: String,
        /// Departed instance's node id
        node_id: String,
    },
}

#[derive(Default)]
struct ClientState {
    /// `"{name}/{version}"` -> known addresses
    cache: HashMap<String, Vec<AddressRecord>>,
    /// Per-service round-robin cursors for entity-less resolution
    round_robin: HashMap<String, usize>,
    /// request_id -> reply slot for in-flight subscriber queries
    pending_queries: HashMap<String, oneshot::Sender<Vec<SubscriberRecord>>>,
}

/// Client half of the registry protocol.
#[derive(Clone)]
pub struct RegistryClient {
    conn: Connection,
    state: Arc<Mutex<ClientState>>,
    events_tx: async_channel::Sender<RegistryEvent>,
    events_rx: async_channel::Receiver<RegistryEvent>,
}

impl RegistryClient {
    /// Connect to the registry.
    pub async fn connect<A: AsyncToSocketAddrs>(addr: A) -> Result<Self> {
        let conn = Connection::connect(addr).await?;
        let (events_tx, events_rx) = async_channel::unbounded();
        Ok(Self {
            conn,
            state: Arc::new(Mutex::new(ClientState::default())),
            events_tx,
            events_rx,
        })
    }

    /// Receiver for registry pushes. The owning bus drains this.
    pub fn events(&self) -> async_channel::Receiver<RegistryEvent> {
        self.events_rx.clone()
    }

    /// Announce a local instance: its served `(service, version)`, listener
    /// address, node id, declared dependencies, and transport kind.
    pub async fn register(
        &self,
        host: &str,
        port: u16,
        service: &str,
        version: &str,
        vendors: Vec<ServiceRef>,
        node_id: &str,
        kind: TransportKind,
    ) -> Result<()> {
        let packet = Packet::register(host, port, node_id, service, version, vendors, kind);
        self.conn.send(&packet).await?;
        Ok(())
    }

    /// Drive the registry connection. Run this in the background; it returns
    /// once the connection drops, after releasing any waiting queries.
    pub async fn driver(&self) -> Result<()> {
        loop {
            match self.conn.recv().await {
                Ok(packet) => self.dispatch(packet).await,
                Err(mesh_wire::Error::Closed) => break,
                Err(err) => {
                    warn!("registry connection failed: {}", err);
                    break;
                }
            }
        }
        // Unblock every caller still waiting on a reply.
        self.state.lock().await.pending_queries.clear();
        Ok(())
    }

    async fn dispatch(&self, packet: Packet) {
        match packet.body {
            Body::Registered { params } => {
                let mut state = self.state.lock().await;
                for vendor in &params.vendors {
                    state.cache.insert(
                        service_key(&vendor.name, &vendor.version),
                        vendor.addresses.clone(),
                    );
                }
                drop(state);
                let _ = self
                    .events_tx
                    .send(RegistryEvent::Activated {
                        vendors: params.vendors,
                    })
                    .await;
            }
            Body::Instances { params } => {
                let addresses = params
                    .instances
                    .iter()
                    .map(|record| AddressRecord {
                        host: record.host.clone(),
                        port: record.port,
                        node_id: record.node.clone(),
                        kind: record.kind,
                    })
                    .collect();
                self.state
                    .lock()
                    .await
                    .cache
                    .insert(service_key(&params.service, &params.version), addresses);
            }
            Body::Deregister { params } => {
                let mut state = self.state.lock().await;
                let key = service_key(&params.service, &params.version);
                if let Some(addresses) = state.cache.get_mut(&key) {
                    addresses.retain(|a| a.node_id != params.node_id);
                }
                drop(state);
                let _ = self
                    .events_tx
                    .send(RegistryEvent::InstanceDown {
                        service: params.service,
                        version: params.version,
                        node_id: params.node_id,
                    })
                    .await;
            }
            Body::Subscribers { request_id, params } => {
                let slot = self
                    .state
                    .lock()
                    .await
                    .pending_queries
                    .remove(&request_id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(params.subscribers);
                    }
                    None => debug!("subscribers reply with unknown request_id {}", request_id),
                }
            }
            _ => {
                debug!("registry client ignoring {} packet", packet.type_name());
            }
        }
    }

    /// Resolve `(service, version, entity)` to one instance of `kind`.
    ///
    /// Instances are ordered by node id before selection so identical inputs
    /// pick identical instances in every process. A non-empty entity hashes
    /// onto the instance list; an empty one round-robins per service.
    pub async fn resolve(
        &self,
        service: &str,
        version: &str,
        entity: &str,
        kind: TransportKind,
    ) -> Option<AddressRecord> {
        let key = service_key(service, version);
        let mut state = self.state.lock().await;

        let mut candidates: Vec<AddressRecord> = state
            .cache
            .get(&key)?
            .iter()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let index = if entity.is_empty() {
            let cursor = state.round_robin.entry(key).or_insert(0);
            let index = *cursor % candidates.len();
            *cursor = cursor.wrapping_add(1);
            index
        } else {
            entity_index(entity, candidates.len())
        };
        Some(candidates.swap_remove(index))
    }

    /// Every known address for the given dependency descriptors.
    pub async fn get_all_addresses(&self, descriptors: &[ServiceRef]) -> Vec<AddressRecord> {
        let state = self.state.lock().await;
        descriptors
            .iter()
            .flat_map(|d| {
                state
                    .cache
                    .get(&service_key(&d.service, &d.version))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Last known address of a node, for reconnects after a liveness drop.
    pub async fn get_for_node(&self, node_id: &str) -> Option<AddressRecord> {
        let state = self.state.lock().await;
        state
            .cache
            .values()
            .flatten()
            .find(|a| a.node_id == node_id)
            .cloned()
    }

    /// Query the current subscriber set of a publisher endpoint, awaiting
    /// the correlated reply.
    pub async fn get_subscribers(
        &self,
        service: &str,
        version: &str,
        endpoint: &str,
    ) -> Result<Vec<SubscriberRecord>> {
        let packet = Packet::get_subscribers(service, version, endpoint);
        let Body::GetSubscribers { request_id, .. } = &packet.body else {
            unreachable!("get_subscribers factory produced a different body");
        };
        let request_id = request_id.clone();

        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .pending_queries
            .insert(request_id.clone(), tx);

        if let Err(err) = self.conn.send(&packet).await {
            self.state.lock().await.pending_queries.remove(&request_id);
            return Err(err.into());
        }

        rx.await.map_err(|_| Error::ConnectionLost)
    }

    /// Install directed subscriptions for the local instance.
    pub async fn x_subscribe(
        &self,
        service: &str,
        version: &str,
        host: &str,
        port: u16,
        node_id: &str,
        events: Vec<EventSubscription>,
    ) -> Result<()> {
        let packet = Packet::xsubscribe(service, version, host, port, node_id, events);
        self.conn.send(&packet).await?;
        Ok(())
    }

    /// Close the registry connection.
    pub fn close(&self) {
        self.conn.close();
    }
}

/// Deterministic instance index for a routing entity.
///
/// FxHash is stable across processes, unlike the std hasher's random seed.
fn entity_index(entity: &str, len: usize) -> usize {
    let mut hasher = FxHasher::default();
    entity.hash(&mut hasher);
    (hasher.finish() as usize) % len
}
