//! Packet envelopes for the mesh protocol
//!
//! Each envelope carries a unique `pid`, a `type` tag, optional `from`/`to`
//! node ids, and type-specific parameters. The serialized field names are
//! fixed by the deployed protocol and must not change.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Transport flavor an instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent framed TCP
    Tcp,
    /// HTTP adapter (external collaborator; addresses only pass through)
    Http,
}

/// Target selection strategy within a subscriber group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Strategy {
    /// Always deliver to the first subscriber in registration order
    Leader,
    /// Deliver to a uniformly random subscriber
    Random,
}

impl<'de> Deserialize<'de> for Strategy {
    // Unknown strategies must degrade to RANDOM rather than fail the packet.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "LEADER" => Strategy::Leader,
            _ => Strategy::Random,
        })
    }
}

/// A `(service, version)` pair, as it appears in vendor lists and lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceRef {
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
}

impl ServiceRef {
    /// Create a reference from name and version.
    pub fn new(service: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
        }
    }
}

/// `register` parameters: the instance announcing itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterParams {
    /// Served service name
    pub service: String,
    /// Served service version
    pub version: String,
    /// Host the instance listens on
    pub host: String,
    /// Port the instance listens on
    pub port: u16,
    /// Globally-unique instance id
    pub node_id: String,
    /// Declared dependencies
    pub vendors: Vec<ServiceRef>,
    /// Transport kind
    #[serde(rename = "type")]
    pub kind: TransportKind,
}

/// One dependency's address list inside an activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorAddresses {
    /// Dependency service name
    pub name: String,
    /// Dependency service version
    pub version: String,
    /// Every registered instance of the dependency
    pub addresses: Vec<AddressRecord>,
}

/// Instance address as carried in activation packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Instance host
    pub host: String,
    /// Instance port
    pub port: u16,
    /// Instance node id
    pub node_id: String,
    /// Transport kind
    #[serde(rename = "type")]
    pub kind: TransportKind,
}

/// Instance record as carried in `instances` replies.
///
/// The deployed protocol names the node field `node` here, unlike the
/// `node_id` used in activation addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance host
    pub host: String,
    /// Instance port
    pub port: u16,
    /// Instance node id
    pub node: String,
    /// Transport kind
    #[serde(rename = "type")]
    pub kind: TransportKind,
}

/// `deregister` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeregisterParams {
    /// Node that went away
    pub node_id: String,
    /// Its service name
    pub service: String,
    /// Its service version
    pub version: String,
}

/// `registered` (activation) parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationParams {
    /// Address lists for every declared dependency
    pub vendors: Vec<VendorAddresses>,
}

/// `instances` reply parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesParams {
    /// Requested service name
    pub service: String,
    /// Requested service version
    pub version: String,
    /// Registered instances
    pub instances: Vec<InstanceRecord>,
}

/// One directed-subscription declaration inside an `xsubscribe`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Publisher service name
    pub service: String,
    /// Publisher service version
    pub version: String,
    /// Publisher endpoint
    pub endpoint: String,
    /// Delivery strategy within the subscriber's group
    pub strategy: Strategy,
}

/// `xsubscribe` parameters: the subscribing instance plus its declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XSubscribeParams {
    /// Subscriber service name
    pub service: String,
    /// Subscriber service version
    pub version: String,
    /// Subscriber host
    pub host: String,
    /// Subscriber port
    pub port: u16,
    /// Subscriber node id
    pub node_id: String,
    /// Directed subscriptions being installed
    pub events: Vec<EventSubscription>,
}

/// `get_subscribers` parameters: the publisher endpoint being queried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRef {
    /// Publisher service name
    pub service: String,
    /// Publisher service version
    pub version: String,
    /// Publisher endpoint
    pub endpoint: String,
}

/// One subscriber in a `subscribers` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    /// Subscriber service name
    pub service: String,
    /// Subscriber service version
    pub version: String,
    /// Subscriber host
    pub host: String,
    /// Subscriber port
    pub port: u16,
    /// Subscriber node id
    pub node_id: String,
    /// Delivery strategy the subscriber registered with
    pub strategy: Strategy,
}

/// `subscribers` reply parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribersParams {
    /// Publisher service name
    pub service: String,
    /// Publisher service version
    pub version: String,
    /// Publisher endpoint
    pub endpoint: String,
    /// Current subscriber set
    pub subscribers: Vec<SubscriberRecord>,
}

/// Type-specific portion of a packet, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Instance registration
    Register {
        /// Registration parameters
        params: RegisterParams,
    },
    /// Activation push (wire name `registered`, kept from the deployed protocol)
    Registered {
        /// Dependency address lists
        params: ActivationParams,
    },
    /// Instance-down notification to consumers
    Deregister {
        /// Departed instance identity
        params: DeregisterParams,
    },
    /// Instance-list query
    GetInstances {
        /// Requested service name (duplicated at top level on the wire)
        service: String,
        /// Requested service version
        version: String,
        /// Requested service reference
        params: ServiceRef,
        /// Correlator echoed in the reply
        request_id: String,
    },
    /// Instance-list reply
    Instances {
        /// Reply parameters
        params: InstancesParams,
    },
    /// Directed-subscription installation
    Xsubscribe {
        /// Subscriber identity and declarations
        params: XSubscribeParams,
    },
    /// Subscriber-set query
    GetSubscribers {
        /// Queried publisher endpoint
        params: EndpointRef,
        /// Correlator echoed in the reply
        request_id: String,
    },
    /// Subscriber-set reply
    Subscribers {
        /// Correlator from the query
        request_id: String,
        /// Reply parameters
        params: SubscribersParams,
    },
    /// Liveness probe
    Ping {
        /// Prober's node id
        node_id: String,
    },
    /// Liveness reply
    Pong {
        /// Responder's node id
        node_id: String,
        /// Pongs sent on this connection so far
        count: u64,
    },
    /// Publish acknowledgement; `request_id` carries the publish id
    Ack {
        /// Acknowledged publish id
        request_id: String,
    },
    /// Peer-to-peer request
    Request {
        /// Originating application, if any
        app: Option<String>,
        /// Target service name
        service: String,
        /// Target service version
        version: String,
        /// Routing entity for instance selection
        entity: String,
        /// Target endpoint
        endpoint: String,
        /// Request payload
        payload: Value,
    },
    /// Directed publish delivery
    Publish {
        /// Publisher service name
        service: String,
        /// Publisher service version
        version: String,
        /// Published endpoint
        endpoint: String,
        /// Event payload
        payload: Value,
        /// Correlator acknowledged by subscribers
        publish_id: String,
    },
}

/// A complete protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Unique packet id
    pub pid: String,
    /// Sending bus's host id, stamped on the send path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Target node id, stamped once the target is resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Type-specific body
    #[serde(flatten)]
    pub body: Body,
}

fn fresh_pid() -> String {
    Uuid::new_v4().to_string()
}

fn fresh_request_id() -> String {
    Uuid::new_v4().to_string()
}

impl Packet {
    fn envelope(body: Body) -> Self {
        Self {
            pid: fresh_pid(),
            from: None,
            to: None,
            body,
        }
    }

    /// Registration announcement for a new instance.
    pub fn register(
        host: impl Into<String>,
        port: u16,
        node_id: impl Into<String>,
        service: impl Into<String>,
        version: impl Into<String>,
        vendors: Vec<ServiceRef>,
        kind: TransportKind,
    ) -> Self {
        Self::envelope(Body::Register {
            params: RegisterParams {
                service: service.into(),
                version: version.into(),
                host: host.into(),
                port,
                node_id: node_id.into(),
                vendors,
                kind,
            },
        })
    }

    /// Instance-list query for `(service, version)`.
    pub fn get_instances(service: impl Into<String>, version: impl Into<String>) -> Self {
        let service = service.into();
        let version = version.into();
        Self::envelope(Body::GetInstances {
            service: service.clone(),
            version: version.clone(),
            params: ServiceRef { service, version },
            request_id: fresh_request_id(),
        })
    }

    /// Subscriber-set query for a publisher endpoint.
    pub fn get_subscribers(
        service: impl Into<String>,
        version: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::envelope(Body::GetSubscribers {
            params: EndpointRef {
                service: service.into(),
                version: version.into(),
                endpoint: endpoint.into(),
            },
            request_id: fresh_request_id(),
        })
    }

    /// Instance-list reply.
    pub fn send_instances(
        service: impl Into<String>,
        version: impl Into<String>,
        instances: Vec<InstanceRecord>,
    ) -> Self {
        Self::envelope(Body::Instances {
            params: InstancesParams {
                service: service.into(),
                version: version.into(),
                instances,
            },
        })
    }

    /// Instance-down notification.
    pub fn deregister(
        service: impl Into<String>,
        version: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self::envelope(Body::Deregister {
            params: DeregisterParams {
                node_id: node_id.into(),
                service: service.into(),
                version: version.into(),
            },
        })
    }

    /// Activation push listing every dependency's addresses.
    pub fn activated(vendors: Vec<VendorAddresses>) -> Self {
        Self::envelope(Body::Registered {
            params: ActivationParams { vendors },
        })
    }

    /// Directed-subscription installation for a subscriber instance.
    pub fn xsubscribe(
        service: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        node_id: impl Into<String>,
        events: Vec<EventSubscription>,
    ) -> Self {
        Self::envelope(Body::Xsubscribe {
            params: XSubscribeParams {
                service: service.into(),
                version: version.into(),
                host: host.into(),
                port,
                node_id: node_id.into(),
                events,
            },
        })
    }

    /// Subscriber-set reply correlated to `request_id`.
    pub fn subscribers(
        service: impl Into<String>,
        version: impl Into<String>,
        endpoint: impl Into<String>,
        request_id: impl Into<String>,
        subscribers: Vec<SubscriberRecord>,
    ) -> Self {
        Self::envelope(Body::Subscribers {
            request_id: request_id.into(),
            params: SubscribersParams {
                service: service.into(),
                version: version.into(),
                endpoint: endpoint.into(),
                subscribers,
            },
        })
    }

    /// Liveness probe.
    pub fn ping(node_id: impl Into<String>) -> Self {
        Self::envelope(Body::Ping {
            node_id: node_id.into(),
        })
    }

    /// Liveness reply carrying the responder's pong count.
    pub fn pong(node_id: impl Into<String>, count: u64) -> Self {
        Self::envelope(Body::Pong {
            node_id: node_id.into(),
            count,
        })
    }

    /// Acknowledgement of the publish identified by `request_id`.
    pub fn ack(request_id: impl Into<String>) -> Self {
        Self::envelope(Body::Ack {
            request_id: request_id.into(),
        })
    }

    /// Peer-to-peer request envelope.
    pub fn request(
        app: Option<String>,
        service: impl Into<String>,
        version: impl Into<String>,
        entity: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::envelope(Body::Request {
            app,
            service: service.into(),
            version: version.into(),
            entity: entity.into(),
            endpoint: endpoint.into(),
            payload,
        })
    }

    /// Directed publish delivery.
    pub fn publish(
        publish_id: impl Into<String>,
        service: impl Into<String>,
        version: impl Into<String>,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::envelope(Body::Publish {
            service: service.into(),
            version: version.into(),
            endpoint: endpoint.into(),
            payload,
            publish_id: publish_id.into(),
        })
    }

    /// Wire name of this packet's type, for logging.
    pub fn type_name(&self) -> &'static str {
        self.body.type_name()
    }
}

impl Body {
    /// Wire name of this body's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Register { .. } => "register",
            Body::Registered { .. } => "registered",
            Body::Deregister { .. } => "deregister",
            Body::GetInstances { .. } => "get_instances",
            Body::Instances { .. } => "instances",
            Body::Xsubscribe { .. } => "xsubscribe",
            Body::GetSubscribers { .. } => "get_subscribers",
            Body::Subscribers { .. } => "subscribers",
            Body::Ping { .. } => "ping",
            Body::Pong { .. } => "pong",
            Body::Ack { .. } => "ack",
            Body::Request { .. } => "request",
            Body::Publish { .. } => "publish",
        }
    }
}
