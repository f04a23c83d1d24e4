//! Data models for the service registry

use mesh_wire::{AddressRecord, InstanceRecord, ServiceRef, TransportKind};
use serde::{Deserialize, Serialize};

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Served service name
    pub service: String,

    /// Served service version
    pub version: String,

    /// Host the instance listens on, as observed by the registry
    pub host: String,

    /// Port the instance listens on
    pub port: u16,

    /// Globally-unique instance id
    pub node_id: String,

    /// Transport kind
    pub kind: TransportKind,

    /// Dependencies declared at registration; set once per service
    pub vendors: Vec<ServiceRef>,
}

impl ServiceInstance {
    /// The service bucket this instance belongs to.
    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef::new(&self.service, &self.version)
    }

    /// Address as carried in activation packets.
    pub fn address(&self) -> AddressRecord {
        AddressRecord {
            host: self.host.clone(),
            port: self.port,
            node_id: self.node_id.clone(),
            kind: self.kind,
        }
    }

    /// Record as carried in `instances` replies.
    pub fn instance_record(&self) -> InstanceRecord {
        InstanceRecord {
            host: self.host.clone(),
            port: self.port,
            node: self.node_id.clone(),
            kind: self.kind,
        }
    }
}

/// Compose the internal bucket key for `(name, version)`.
pub(crate) fn service_key(service: &str, version: &str) -> String {
    format!("{}/{}", service, version)
}

/// Split a bucket key back into `(name, version)`.
pub(crate) fn split_key(key: &str) -> ServiceRef {
    match key.split_once('/') {
        Some((service, version)) => ServiceRef::new(service, version),
        None => ServiceRef::new(key, ""),
    }
}
