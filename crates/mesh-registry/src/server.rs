//! Registry server
//!
//! A connection-oriented server speaking the framed packet protocol. Each
//! accepted connection is handled by a [`ConnectionHandler`] the caller
//! spawns. All registry state sits behind one lock, so every inbound packet
//! is processed to completion before the next one touches the state; the
//! activation sweep is therefore atomic with respect to concurrent
//! registrations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_net::TcpListener;
use futures::lock::Mutex;
use mesh_runtime::SharedSpawner;
use mesh_wire::{
    Body, Connection, EndpointRef, Packet, RegisterParams, ServiceRef, SubscriberRecord,
    TransportKind, VendorAddresses, XSubscribeParams,
};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::ServiceInstance;
use crate::repository::Repository;

/// Registry server: accepts control connections from service processes.
pub struct RegistryServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<RegistryState>,
    spawner: SharedSpawner,
}

#[derive(Default)]
struct RegistryState {
    repository: Repository,
    /// node_id -> inbound control connection used to push activations
    control_links: HashMap<String, Connection>,
    /// node_id -> registry-initiated connection to the instance's listener
    outbound_links: HashMap<String, Connection>,
    /// `"{service}/{version}/{endpoint}"` -> directed subscribers
    subscriptions: HashMap<String, Vec<SubscriberRecord>>,
}

fn subscription_key(service: &str, version: &str, endpoint: &str) -> String {
    format!("{}/{}/{}", service, version, endpoint)
}

impl RegistryServer {
    /// Bind the registry listener.
    pub async fn bind(addr: impl AsRef<str>, spawner: SharedSpawner) -> Result<Self> {
        let listener = TcpListener::bind(addr.as_ref()).await?;
        info!("registry listening on {}", addr.as_ref());

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::default()),
                spawner,
            }),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a new control connection.
    pub async fn accept(&self) -> Result<ConnectionHandler> {
        let (stream, peer) = self.listener.accept().await?;
        debug!("new registry connection from {}", peer);

        Ok(ConnectionHandler {
            conn: Connection::new(stream),
            peer,
            shared: self.shared.clone(),
            node_id: None,
        })
    }
}

/// Handler for one control connection.
pub struct ConnectionHandler {
    conn: Connection,
    peer: SocketAddr,
    shared: Arc<Shared>,
    node_id: Option<String>,
}

impl ConnectionHandler {
    /// Drive the connection until the peer goes away, then deregister
    /// whatever node registered on it.
    pub async fn handle(mut self) -> Result<()> {
        loop {
            match self.conn.recv().await {
                Ok(packet) => self.process(packet).await,
                Err(mesh_wire::Error::Closed) => {
                    debug!("peer {} closed its control connection", self.peer);
                    break;
                }
                Err(err) => {
                    warn!("control connection from {} failed: {}", self.peer, err);
                    break;
                }
            }
        }

        if let Some(node_id) = self.node_id.take() {
            self.shared.deregister_node(&node_id).await;
        }
        Ok(())
    }

    async fn process(&mut self, packet: Packet) {
        match packet.body {
            Body::Register { params } => {
                self.node_id = Some(params.node_id.clone());
                Shared::register(&self.shared, params, self.peer, self.conn.clone()).await;
            }
            Body::GetInstances {
                params, request_id, ..
            } => {
                self.reply_instances(params, request_id).await;
            }
            Body::Xsubscribe { params } => {
                self.shared.x_subscribe(params).await;
            }
            Body::GetSubscribers { params, request_id } => {
                self.reply_subscribers(params, request_id).await;
            }
            Body::Deregister { params } => {
                self.shared.deregister_node(&params.node_id).await;
            }
            other => {
                debug!(
                    "registry ignoring {} packet from {}",
                    other.type_name(),
                    self.peer
                );
            }
        }
    }

    async fn reply_instances(&self, params: ServiceRef, _request_id: String) {
        let instances = {
            let state = self.shared.state.lock().await;
            state
                .repository
                .get_instances(&params.service, &params.version)
                .iter()
                .map(ServiceInstance::instance_record)
                .collect()
        };
        let reply = Packet::send_instances(&params.service, &params.version, instances);
        if let Err(err) = self.conn.send(&reply).await {
            warn!("instances reply to {} failed: {}", self.peer, err);
        }
    }

    async fn reply_subscribers(&self, params: EndpointRef, request_id: String) {
        let subscribers = {
            let state = self.shared.state.lock().await;
            state
                .subscriptions
                .get(&subscription_key(
                    &params.service,
                    &params.version,
                    &params.endpoint,
                ))
                .cloned()
                .unwrap_or_default()
        };
        let reply = Packet::subscribers(
            &params.service,
            &params.version,
            &params.endpoint,
            request_id,
            subscribers,
        );
        if let Err(err) = self.conn.send(&reply).await {
            warn!("subscribers reply to {} failed: {}", self.peer, err);
        }
    }
}

impl Shared {
    /// Record a new instance, remember its control connection, open the
    /// outbound link to tcp instances, then run the activation sweep.
    async fn register(
        shared: &Arc<Self>,
        params: RegisterParams,
        peer: SocketAddr,
        conn: Connection,
    ) {
        let instance = ServiceInstance {
            service: params.service,
            version: params.version,
            host: peer.ip().to_string(),
            port: params.port,
            node_id: params.node_id,
            kind: params.kind,
            vendors: params.vendors,
        };

        info!(
            "registering {}/{} instance {} at {}:{}",
            instance.service, instance.version, instance.node_id, instance.host, instance.port
        );

        let mut state = shared.state.lock().await;
        state.repository.register_service(instance.clone());
        state
            .control_links
            .insert(instance.node_id.clone(), conn);

        if instance.kind == TransportKind::Tcp {
            Self::connect_to_instance(shared, &instance);
        }

        Self::activation_sweep(&mut state).await;
    }

    /// Open the registry-initiated connection to a newly registered
    /// instance. Failure only costs liveness signaling for that instance;
    /// the registration itself stands.
    fn connect_to_instance(shared: &Arc<Self>, instance: &ServiceInstance) {
        let task_shared = shared.clone();
        let node_id = instance.node_id.clone();
        let host = instance.host.clone();
        let port = instance.port;

        shared.spawner.spawn(Box::pin(async move {
            match Connection::connect((host.as_str(), port)).await {
                Ok(conn) => {
                    task_shared
                        .state
                        .lock()
                        .await
                        .outbound_links
                        .insert(node_id.clone(), conn.clone());
                    // Drain until the link drops; a dead listener means the
                    // instance itself is gone.
                    while conn.recv().await.is_ok() {}
                    task_shared.deregister_node(&node_id).await;
                }
                Err(err) => {
                    warn!("outbound connection to {} failed: {}", node_id, err);
                }
            }
        }));
    }

    /// Activate every pending instance whose dependencies all have at least
    /// one registered instance.
    async fn activation_sweep(state: &mut RegistryState) {
        for pending_service in state.repository.get_pending_services() {
            let vendors = state
                .repository
                .get_vendors(&pending_service.service, &pending_service.version);
            let ready = vendors.iter().all(|vendor| {
                !state
                    .repository
                    .get_instances(&vendor.service, &vendor.version)
                    .is_empty()
            });
            if !ready {
                continue;
            }

            for node_id in state
                .repository
                .get_pending_instances(&pending_service.service, &pending_service.version)
            {
                let packet = Self::activation_packet(&state.repository, &vendors);
                if let Some(conn) = state.control_links.get(&node_id) {
                    if let Err(err) = conn.send(&packet).await {
                        warn!("activation push to {} failed: {}", node_id, err);
                    } else {
                        info!(
                            "activated {}/{} instance {}",
                            pending_service.service, pending_service.version, node_id
                        );
                    }
                } else {
                    warn!("no control link for pending node {}", node_id);
                }
                state.repository.remove_pending_instance(
                    &pending_service.service,
                    &pending_service.version,
                    &node_id,
                );
            }
        }
    }

    fn activation_packet(repository: &Repository, vendors: &[ServiceRef]) -> Packet {
        let vendor_addresses = vendors
            .iter()
            .map(|vendor| VendorAddresses {
                name: vendor.service.clone(),
                version: vendor.version.clone(),
                addresses: repository
                    .get_instances(&vendor.service, &vendor.version)
                    .iter()
                    .map(ServiceInstance::address)
                    .collect(),
            })
            .collect();
        Packet::activated(vendor_addresses)
    }

    /// Record directed subscriptions, replacing any earlier declaration the
    /// same node made for the same publisher endpoint.
    async fn x_subscribe(&self, params: XSubscribeParams) {
        let mut state = self.state.lock().await;
        for event in params.events {
            let record = SubscriberRecord {
                service: params.service.clone(),
                version: params.version.clone(),
                host: params.host.clone(),
                port: params.port,
                node_id: params.node_id.clone(),
                strategy: event.strategy,
            };
            let key = subscription_key(&event.service, &event.version, &event.endpoint);
            let subscribers = state.subscriptions.entry(key).or_default();
            subscribers.retain(|s| s.node_id != record.node_id);
            subscribers.push(record);
        }
    }

    /// Drop a node: notify every consumer instance, and when the last
    /// instance of the service is gone, re-mark every instance of every
    /// consumer pending so a replacement reactivates them.
    async fn deregister_node(&self, node_id: &str) {
        let mut state = self.state.lock().await;
        let Some(instance) = state.repository.remove_node(node_id) else {
            return;
        };

        info!(
            "deregistering {}/{} instance {}",
            instance.service, instance.version, node_id
        );

        state.control_links.remove(node_id);
        if let Some(conn) = state.outbound_links.remove(node_id) {
            conn.close();
        }
        for subscribers in state.subscriptions.values_mut() {
            subscribers.retain(|s| s.node_id != node_id);
        }

        let consumers = state
            .repository
            .get_consumers(&instance.service, &instance.version);

        for consumer in &consumers {
            for consumer_instance in state
                .repository
                .get_instances(&consumer.service, &consumer.version)
            {
                let packet = Packet::deregister(&instance.service, &instance.version, node_id);
                if let Some(conn) = state.control_links.get(&consumer_instance.node_id) {
                    if let Err(err) = conn.send(&packet).await {
                        warn!(
                            "deregister notice to {} failed: {}",
                            consumer_instance.node_id, err
                        );
                    }
                }
            }
        }

        let collapsed = state
            .repository
            .get_instances(&instance.service, &instance.version)
            .is_empty();
        if collapsed {
            for consumer in &consumers {
                for consumer_instance in state
                    .repository
                    .get_instances(&consumer.service, &consumer.version)
                {
                    state.repository.add_pending_service(
                        &consumer.service,
                        &consumer.version,
                        &consumer_instance.node_id,
                    );
                }
            }
        }
    }
}
