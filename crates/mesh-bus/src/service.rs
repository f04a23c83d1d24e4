//! Local service descriptions and endpoint tables
//!
//! Endpoints are registered explicitly at construction time, each with its
//! capability: request-serving endpoints live on the [`ServiceHost`],
//! broker and directed subscriptions on the [`ServiceClient`] for the
//! dependency that publishes them. The buses dispatch by table lookup only.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use mesh_wire::{EventSubscription, Packet, ServiceRef, Strategy};
use serde_json::Value;

/// Inbound request context handed to an API handler.
#[derive(Debug, Clone)]
pub struct RequestIn {
    /// Sender's host id, from the packet's `from` field
    pub from: String,
    /// Routing entity
    pub entity: String,
    /// Request payload
    pub payload: Value,
}

/// Handler for one request-serving endpoint. The returned envelope is sent
/// back on the connection the request arrived on; handler-level failures
/// ride inside that envelope.
pub type ApiHandler = Arc<dyn Fn(RequestIn) -> BoxFuture<'static, Packet> + Send + Sync>;

/// Handler for a subscription endpoint, invoked with the decoded payload.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// The service this process serves, with its endpoint table.
#[derive(Clone)]
pub struct ServiceHost {
    name: String,
    version: String,
    endpoints: HashMap<String, ApiHandler>,
}

impl ServiceHost {
    /// Describe the locally served `(name, version)`.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            endpoints: HashMap::new(),
        }
    }

    /// Register a request-serving endpoint.
    pub fn with_api<F, Fut>(mut self, endpoint: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestIn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Packet> + Send + 'static,
    {
        self.endpoints
            .insert(endpoint.into(), Arc::new(move |req| Box::pin(handler(req))));
        self
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Whether an inbound packet addressed to `(service, version)` is ours.
    pub fn serves(&self, service: &str, version: &str) -> bool {
        self.name == service && self.version == version
    }

    /// Look up the handler for an endpoint.
    pub fn handler(&self, endpoint: &str) -> Option<ApiHandler> {
        self.endpoints.get(endpoint).cloned()
    }
}

/// A declared dependency, with the subscription endpoints this process
/// installs against it.
#[derive(Clone)]
pub struct ServiceClient {
    name: String,
    version: String,
    /// Broker fan-out subscriptions
    subscriptions: HashMap<String, EventHandler>,
    /// Directed subscriptions with their delivery strategy
    xsubscriptions: HashMap<String, (Strategy, EventHandler)>,
}

impl ServiceClient {
    /// Describe a dependency on `(name, version)`.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            subscriptions: HashMap::new(),
            xsubscriptions: HashMap::new(),
        }
    }

    /// Register a broker fan-out subscription.
    pub fn with_subscription<F, Fut>(mut self, endpoint: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscriptions
            .insert(endpoint.into(), Arc::new(move |payload| Box::pin(handler(payload))));
        self
    }

    /// Register a directed (acknowledged) subscription.
    pub fn with_xsubscription<F, Fut>(
        mut self,
        endpoint: impl Into<String>,
        strategy: Strategy,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.xsubscriptions.insert(
            endpoint.into(),
            (strategy, Arc::new(move |payload| Box::pin(handler(payload)))),
        );
        self
    }

    /// Dependency name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dependency version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Dependency as a `(service, version)` descriptor.
    pub fn descriptor(&self) -> ServiceRef {
        ServiceRef::new(&self.name, &self.version)
    }

    /// Whether this client covers publishes from `(service, version)`.
    pub fn matches(&self, service: &str, version: &str) -> bool {
        self.name == service && self.version == version
    }

    /// Handler for an inbound event, directed table first.
    pub fn event_handler(&self, endpoint: &str) -> Option<EventHandler> {
        self.xsubscriptions
            .get(endpoint)
            .map(|(_, handler)| handler.clone())
            .or_else(|| self.subscriptions.get(endpoint).cloned())
    }

    /// Broker subscription endpoints.
    pub fn subscription_endpoints(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    /// Directed subscriptions as wire declarations.
    pub fn xsubscribe_events(&self) -> Vec<EventSubscription> {
        self.xsubscriptions
            .iter()
            .map(|(endpoint, (strategy, _))| EventSubscription {
                service: self.name.clone(),
                version: self.version.clone(),
                endpoint: endpoint.clone(),
                strategy: *strategy,
            })
            .collect()
    }
}
