//! Dependency resolution seam
//!
//! The buses never talk to the registry client directly; they go through
//! [`Directory`], which tests replace with a stub.

use async_trait::async_trait;
use mesh_registry::RegistryClient;
use mesh_wire::{AddressRecord, EventSubscription, ServiceRef, SubscriberRecord, TransportKind};

use crate::error::Result;

/// Resolved view of the mesh, as the buses need it.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolve `(service, version, entity)` to one instance of `kind`.
    async fn resolve(
        &self,
        service: &str,
        version: &str,
        entity: &str,
        kind: TransportKind,
    ) -> Option<AddressRecord>;

    /// Every known address for the given dependency descriptors.
    async fn addresses_for(&self, descriptors: &[ServiceRef]) -> Vec<AddressRecord>;

    /// Last known address of a node, for reconnects.
    async fn address_of(&self, node_id: &str) -> Option<AddressRecord>;

    /// Current subscriber set of a publisher endpoint.
    async fn subscribers_for(
        &self,
        service: &str,
        version: &str,
        endpoint: &str,
    ) -> Result<Vec<SubscriberRecord>>;

    /// Install directed subscriptions for the local instance.
    #[allow(clippy::too_many_arguments)]
    async fn install_subscriptions(
        &self,
        service: &str,
        version: &str,
        host: &str,
        port: u16,
        node_id: &str,
        events: Vec<EventSubscription>,
    ) -> Result<()>;
}

#[async_trait]
impl Directory for RegistryClient {
    async fn resolve(
        &self,
        service: &str,
        version: &str,
        entity: &str,
        kind: TransportKind,
    ) -> Option<AddressRecord> {
        RegistryClient::resolve(self, service, version, entity, kind).await
    }

    async fn addresses_for(&self, descriptors: &[ServiceRef]) -> Vec<AddressRecord> {
        self.get_all_addresses(descriptors).await
    }

    async fn address_of(&self, node_id: &str) -> Option<AddressRecord> {
        self.get_for_node(node_id).await
    }

    async fn subscribers_for(
        &self,
        service: &str,
        version: &str,
        endpoint: &str,
    ) -> Result<Vec<SubscriberRecord>> {
        Ok(self.get_subscribers(service, version, endpoint).await?)
    }

    async fn install_subscriptions(
        &self,
        service: &str,
        version: &str,
        host: &str,
        port: u16,
        node_id: &str,
        events: Vec<EventSubscription>,
    ) -> Result<()> {
        Ok(self
            .x_subscribe(service, version, host, port, node_id, events)
            .await?)
    }
}
