//! Shared test fixtures for the bus suites

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::lock::Mutex;
use mesh_bus::{Directory, Result};
use mesh_runtime::{SharedSpawner, SmolSpawner};
use mesh_wire::{
    AddressRecord, EventSubscription, ServiceRef, Strategy, SubscriberRecord, TransportKind,
};

pub fn spawner() -> SharedSpawner {
    Arc::new(SmolSpawner)
}

pub fn address_record(addr: SocketAddr, node_id: &str) -> AddressRecord {
    AddressRecord {
        host: addr.ip().to_string(),
        port: addr.port(),
        node_id: node_id.to_string(),
        kind: TransportKind::Tcp,
    }
}

pub fn subscriber_record(
    addr: SocketAddr,
    node_id: &str,
    service: &str,
    strategy: Strategy,
) -> SubscriberRecord {
    SubscriberRecord {
        service: service.to_string(),
        version: "1".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        node_id: node_id.to_string(),
        strategy,
    }
}

/// Directory stub with scriptable contents.
#[derive(Default)]
pub struct StubDirectory {
    addresses: Mutex<HashMap<String, AddressRecord>>,
    subscribers: Mutex<Vec<SubscriberRecord>>,
    installed: Mutex<Vec<EventSubscription>>,
}

impl StubDirectory {
    pub async fn put_address(&self, service: &str, version: &str, address: AddressRecord) {
        self.addresses
            .lock()
            .await
            .insert(format!("{}/{}", service, version), address);
    }

    pub async fn set_subscribers(&self, subscribers: Vec<SubscriberRecord>) {
        *self.subscribers.lock().await = subscribers;
    }

    pub async fn installed_events(&self) -> Vec<EventSubscription> {
        self.installed.lock().await.clone()
    }
}

#[async_trait]
impl Directory for StubDirectory {
    async fn resolve(
        &self,
        service: &str,
        version: &str,
        _entity: &str,
        kind: TransportKind,
    ) -> Option<AddressRecord> {
        self.addresses
            .lock()
            .await
            .get(&format!("{}/{}", service, version))
            .filter(|a| a.kind == kind)
            .cloned()
    }

    async fn addresses_for(&self, descriptors: &[ServiceRef]) -> Vec<AddressRecord> {
        let addresses = self.addresses.lock().await;
        descriptors
            .iter()
            .filter_map(|d| addresses.get(&format!("{}/{}", d.service, d.version)).cloned())
            .collect()
    }

    async fn address_of(&self, node_id: &str) -> Option<AddressRecord> {
        self.addresses
            .lock()
            .await
            .values()
            .find(|a| a.node_id == node_id)
            .cloned()
    }

    async fn subscribers_for(
        &self,
        _service: &str,
        _version: &str,
        _endpoint: &str,
    ) -> Result<Vec<SubscriberRecord>> {
        Ok(self.subscribers.lock().await.clone())
    }

    async fn install_subscriptions(
        &self,
        _service: &str,
        _version: &str,
        _host: &str,
        _port: u16,
        _node_id: &str,
        events: Vec<EventSubscription>,
    ) -> Result<()> {
        self.installed.lock().await.extend(events);
        Ok(())
    }
}
