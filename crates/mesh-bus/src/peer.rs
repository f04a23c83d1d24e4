//! Peer bus over TCP
//!
//! Maintains the outbound links to every dependency instance, queues
//! requests until their target link is up, serves inbound requests against
//! the local endpoint table, and answers liveness probes. Activation and
//! instance-down pushes arrive through the registry client's event channel;
//! the bus owns its clients and nothing points back at it.

use std::collections::HashMap;
use std::sync::Arc;

use async_net::TcpListener;
use futures::lock::Mutex;
use mesh_registry::RegistryEvent;
use mesh_runtime::SharedSpawner;
use mesh_wire::{AddressRecord, Body, Connection, Packet, TransportKind};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::directory::Directory;
use crate::error::{Error, Result};
use crate::liveness::{LivenessConfig, PingOutcome, Pinger};
use crate::retry::{RetryPolicy, connect_with_retry};
use crate::service::{RequestIn, ServiceClient, ServiceHost};

/// Per-process peer bus.
#[derive(Clone)]
pub struct PeerBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    host_id: String,
    host: ServiceHost,
    clients: Vec<ServiceClient>,
    directory: Arc<dyn Directory>,
    spawner: SharedSpawner,
    retry: RetryPolicy,
    liveness: LivenessConfig,
    state: Mutex<BusState>,
    replies_tx: async_channel::Sender<Packet>,
    replies_rx: async_channel::Receiver<Packet>,
}

#[derive(Default)]
struct BusState {
    /// node_id -> outbound dependency link
    client_links: HashMap<String, Connection>,
    /// Requests produced before their target link was ready
    pending_requests: Vec<Packet>,
}

impl PeerBus {
    /// Create a bus with the default retry and liveness settings.
    pub fn new(
        host: ServiceHost,
        clients: Vec<ServiceClient>,
        directory: Arc<dyn Directory>,
        spawner: SharedSpawner,
    ) -> Self {
        Self::with_config(
            host,
            clients,
            directory,
            spawner,
            RetryPolicy::default(),
            LivenessConfig::default(),
        )
    }

    /// Create a bus with explicit retry and liveness settings.
    pub fn with_config(
        host: ServiceHost,
        clients: Vec<ServiceClient>,
        directory: Arc<dyn Directory>,
        spawner: SharedSpawner,
        retry: RetryPolicy,
        liveness: LivenessConfig,
    ) -> Self {
        let (replies_tx, replies_rx) = async_channel::unbounded();
        Self {
            inner: Arc::new(BusInner {
                host_id: Uuid::new_v4().to_string(),
                host,
                clients,
                directory,
                spawner,
                retry,
                liveness,
                state: Mutex::new(BusState::default()),
                replies_tx,
                replies_rx,
            }),
        }
    }

    /// This bus's host id, stamped into every outgoing packet.
    pub fn host_id(&self) -> &str {
        &self.inner.host_id
    }

    /// Envelopes received in reply to our requests. The service adapter
    /// drains this and does its own correlation.
    pub fn replies(&self) -> async_channel::Receiver<Packet> {
        self.inner.replies_rx.clone()
    }

    /// Send a packet. Requests are queued and drained as links allow; no
    /// other type has a send path on this bus.
    pub async fn send(&self, mut packet: Packet) -> Result<()> {
        packet.from = Some(self.inner.host_id.clone());
        match packet.body {
            Body::Request { .. } => {
                self.inner.state.lock().await.pending_requests.push(packet);
                BusInner::drain_pending(&self.inner).await;
                Ok(())
            }
            _ => Err(Error::UnsupportedSend(packet.body.type_name())),
        }
    }

    /// Number of requests still waiting for a link.
    pub async fn pending_request_count(&self) -> usize {
        self.inner.state.lock().await.pending_requests.len()
    }

    /// Whether an outbound link to `node_id` is currently installed.
    pub async fn is_linked(&self, node_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .client_links
            .contains_key(node_id)
    }

    /// Accept inbound peer connections forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("peer connection from {}", peer);
            let inner = self.inner.clone();
            let conn = Connection::new(stream);
            self.inner.spawner.spawn(Box::pin(async move {
                BusInner::handle_inbound(inner, conn).await;
            }));
        }
    }

    /// Consume registry pushes: open dependency links on activation, drop
    /// them when an instance goes down. Run this in the background.
    pub async fn run_events(&self, events: async_channel::Receiver<RegistryEvent>) {
        while let Ok(event) = events.recv().await {
            match event {
                RegistryEvent::Activated { vendors } => {
                    for vendor in vendors {
                        for address in vendor.addresses {
                            if address.kind == TransportKind::Tcp {
                                self.ensure_link(address).await;
                            }
                        }
                    }
                }
                RegistryEvent::InstanceDown { node_id, .. } => {
                    let mut state = self.inner.state.lock().await;
                    if let Some(conn) = state.client_links.remove(&node_id) {
                        info!("dropping link to deregistered instance {}", node_id);
                        conn.close();
                    }
                }
            }
        }
    }

    async fn ensure_link(&self, address: AddressRecord) {
        {
            let state = self.inner.state.lock().await;
            if state.client_links.contains_key(&address.node_id) {
                return;
            }
        }
        BusInner::spawn_link(self.inner.clone(), address);
    }
}

impl BusInner {
    /// Bring up one dependency link: connect with retry, install it, drain
    /// the backlog, then babysit it with the pinger. Timeouts and drops
    /// reconnect through the directory's last known address.
    fn spawn_link(inner: Arc<BusInner>, address: AddressRecord) {
        let spawner = inner.spawner.clone();
        spawner.spawn(Box::pin(async move {
            let conn = match connect_with_retry(&address.host, address.port, &inner.retry).await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("link to {} did not come up: {}", address.node_id, err);
                    return;
                }
            };
            info!(
                "linked dependency instance {} at {}:{}",
                address.node_id, address.host, address.port
            );

            let (pong_tx, pong_rx) = async_channel::unbounded();
            inner
                .state
                .lock()
                .await
                .client_links
                .insert(address.node_id.clone(), conn.clone());

            let driver_inner = inner.clone();
            let driver_conn = conn.clone();
            inner.spawner.spawn(Box::pin(async move {
                Self::drive_client_link(driver_inner, driver_conn, pong_tx).await;
            }));

            Self::drain_pending(&inner).await;

            let pinger = Pinger::new(
                conn.clone(),
                address.node_id.clone(),
                inner.host_id.clone(),
                inner.liveness.clone(),
                pong_rx,
            );
            let outcome = pinger.run().await;

            inner
                .state
                .lock()
                .await
                .client_links
                .remove(&address.node_id);
            conn.close();

            match outcome {
                PingOutcome::TimedOut => {
                    warn!("liveness lost for {}", address.node_id);
                }
                PingOutcome::Closed => {
                    debug!("link to {} closed", address.node_id);
                }
            }
            if let Some(fresh) = inner.directory.address_of(&address.node_id).await {
                info!("reconnecting to {}", fresh.node_id);
                Self::spawn_link(inner.clone(), fresh);
            }
        }));
    }

    /// Read loop for an outbound dependency link: pongs feed the pinger,
    /// pings are answered, publishes delivered, and anything else is a
    /// reply envelope for the adapter.
    async fn drive_client_link(
        inner: Arc<BusInner>,
        conn: Connection,
        pongs: async_channel::Sender<u64>,
    ) {
        let mut pongs_sent = 0u64;
        loop {
            let packet = match conn.recv().await {
                Ok(packet) => packet,
                Err(_) => break,
            };
            match packet.body {
                Body::Pong { count, .. } => {
                    let _ = pongs.send(count).await;
                }
                Body::Ping { node_id } => {
                    pongs_sent += 1;
                    inner.answer_ping(&conn, node_id, pongs_sent).await;
                }
                Body::Publish {
                    service,
                    version,
                    endpoint,
                    payload,
                    publish_id,
                } => {
                    inner
                        .deliver_publish(&conn, &service, &version, &endpoint, payload, publish_id)
                        .await;
                }
                _ => {
                    let _ = inner.replies_tx.send(packet).await;
                }
            }
        }
    }

    /// Read loop for one inbound peer connection.
    async fn handle_inbound(inner: Arc<BusInner>, conn: Connection) {
        let mut pongs_sent = 0u64;
        loop {
            let packet = match conn.recv().await {
                Ok(packet) => packet,
                Err(_) => break,
            };
            let from_id = packet.from.clone().unwrap_or_default();
            match packet.body {
                Body::Ping { node_id } => {
                    pongs_sent += 1;
                    inner.answer_ping(&conn, node_id, pongs_sent).await;
                }
                Body::Pong { .. } => {
                    debug!("unexpected pong on an inbound link");
                }
                Body::Publish {
                    service,
                    version,
                    endpoint,
                    payload,
                    publish_id,
                } => {
                    inner
                        .deliver_publish(&conn, &service, &version, &endpoint, payload, publish_id)
                        .await;
                }
                Body::Request {
                    service,
                    version,
                    entity,
                    endpoint,
                    payload,
                    ..
                } => {
                    inner
                        .serve_request(&conn, from_id, service, version, entity, endpoint, payload)
                        .await;
                }
                other => {
                    debug!("peer bus dropping {} packet", other.type_name());
                }
            }
        }
    }

    async fn answer_ping(&self, conn: &Connection, node_id: String, count: u64) {
        if self.liveness.ping_logs {
            debug!("ping <- {}, answering with count {}", node_id, count);
        }
        let mut pong = Packet::pong(node_id, count);
        pong.from = Some(self.host_id.clone());
        if let Err(err) = conn.send(&pong).await {
            debug!("pong send failed: {}", err);
        }
    }

    /// Hand a publish to every matching client handler, then ack it.
    async fn deliver_publish(
        &self,
        conn: &Connection,
        service: &str,
        version: &str,
        endpoint: &str,
        payload: Value,
        publish_id: String,
    ) {
        let mut matched = false;
        for client in &self.clients {
            if !client.matches(service, version) {
                continue;
            }
            matched = true;
            match client.event_handler(endpoint) {
                Some(handler) => {
                    let payload = payload.clone();
                    self.spawner.spawn(Box::pin(async move {
                        handler(payload).await;
                    }));
                }
                None => {
                    warn!("no handler for {} on {}/{}", endpoint, service, version);
                }
            }
        }
        if !matched {
            debug!("publish from {}/{} matches no local client", service, version);
        }

        let mut ack = Packet::ack(publish_id);
        ack.from = Some(self.host_id.clone());
        if let Err(err) = conn.send(&ack).await {
            debug!("ack send failed: {}", err);
        }
    }

    /// Route an inbound request to the local endpoint table and send the
    /// handler's envelope back on the same connection. Mismatched routing
    /// and unknown endpoints are logged and dropped without a reply.
    async fn serve_request(
        &self,
        conn: &Connection,
        from_id: String,
        service: String,
        version: String,
        entity: String,
        endpoint: String,
        payload: Value,
    ) {
        if !self.host.serves(&service, &version) {
            warn!(
                "wrongly routed request for {}/{} (serving {}/{})",
                service,
                version,
                self.host.name(),
                self.host.version()
            );
            return;
        }
        let Some(handler) = self.host.handler(&endpoint) else {
            warn!("no api endpoint {} on {}/{}", endpoint, service, version);
            return;
        };

        let conn = conn.clone();
        let host_id = self.host_id.clone();
        self.spawner.spawn(Box::pin(async move {
            let mut reply = handler(RequestIn {
                from: from_id,
                entity,
                payload,
            })
            .await;
            reply.from = Some(host_id);
            if let Err(err) = conn.send(&reply).await {
                warn!("reply send failed: {}", err);
            }
        }));
    }

    /// Walk the request backlog, sending every packet whose target resolves
    /// to a connected link. The rest stay queued.
    async fn drain_pending(inner: &Arc<BusInner>) {
        let mut state = inner.state.lock().await;
        let queue = std::mem::take(&mut state.pending_requests);
        let mut remaining = Vec::new();

        for mut packet in queue {
            let target = match &packet.body {
                Body::Request {
                    service,
                    version,
                    entity,
                    ..
                } => {
                    inner
                        .directory
                        .resolve(service, version, entity, TransportKind::Tcp)
                        .await
                }
                _ => None,
            };
            let Some(address) = target else {
                remaining.push(packet);
                continue;
            };
            let Some(conn) = state.client_links.get(&address.node_id) else {
                remaining.push(packet);
                continue;
            };
            if !conn.is_connected() {
                remaining.push(packet);
                continue;
            }

            packet.to = Some(address.node_id.clone());
            if let Err(err) = conn.send(&packet).await {
                warn!("request to {} failed, requeueing: {}", address.node_id, err);
                packet.to = None;
                remaining.push(packet);
            }
        }

        state.pending_requests = remaining;
    }
}
