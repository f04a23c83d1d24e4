//! In-memory registry state
//!
//! Pure bookkeeping, no I/O. Owned exclusively by the registry server; all
//! mutation happens under the server's state lock.

use std::collections::HashMap;

use mesh_wire::ServiceRef;

use crate::models::{ServiceInstance, service_key, split_key};

/// Registered services, their instances, pending activations, and the
/// dependency graph.
#[derive(Debug, Default)]
pub struct Repository {
    /// `"{name}/{version}"` -> registered instances
    instances: HashMap<String, Vec<ServiceInstance>>,
    /// `"{name}/{version}"` -> node ids awaiting activation
    pending: HashMap<String, Vec<String>>,
    /// `"{name}/{version}"` -> declared dependencies, set on first sight
    dependencies: HashMap<String, Vec<ServiceRef>>,
}

impl Repository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new instance and mark it pending. The service's dependency
    /// list is taken from the first instance to register and never mutated
    /// by later ones.
    pub fn register_service(&mut self, instance: ServiceInstance) {
        let key = service_key(&instance.service, &instance.version);
        self.dependencies
            .entry(key.clone())
            .or_insert_with(|| instance.vendors.clone());
        self.pending
            .entry(key.clone())
            .or_default()
            .push(instance.node_id.clone());
        self.instances.entry(key).or_default().push(instance);
    }

    /// Re-enqueue a previously-activated node as pending. No-op when the
    /// node is already pending.
    pub fn add_pending_service(&mut self, service: &str, version: &str, node_id: &str) {
        let pending = self.pending.entry(service_key(service, version)).or_default();
        if !pending.iter().any(|n| n == node_id) {
            pending.push(node_id.to_string());
        }
    }

    /// Every service with a pending bucket.
    pub fn get_pending_services(&self) -> Vec<ServiceRef> {
        self.pending.keys().map(|key| split_key(key)).collect()
    }

    /// Node ids of `(service, version)` still awaiting activation.
    pub fn get_pending_instances(&self, service: &str, version: &str) -> Vec<String> {
        self.pending
            .get(&service_key(service, version))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop one node from the pending bucket.
    pub fn remove_pending_instance(&mut self, service: &str, version: &str, node_id: &str) {
        if let Some(pending) = self.pending.get_mut(&service_key(service, version)) {
            pending.retain(|n| n != node_id);
        }
    }

    /// Registered instances of `(service, version)`.
    pub fn get_instances(&self, service: &str, version: &str) -> Vec<ServiceInstance> {
        self.instances
            .get(&service_key(service, version))
            .cloned()
            .unwrap_or_default()
    }

    /// What `(service, version)` depends on.
    pub fn get_vendors(&self, service: &str, version: &str) -> Vec<ServiceRef> {
        self.dependencies
            .get(&service_key(service, version))
            .cloned()
            .unwrap_or_default()
    }

    /// What depends on `(service, version)`.
    pub fn get_consumers(&self, service: &str, version: &str) -> Vec<ServiceRef> {
        let mut consumers = Vec::new();
        for (key, vendors) in &self.dependencies {
            let depends = vendors
                .iter()
                .any(|v| v.service == service && v.version == version);
            if depends {
                consumers.push(split_key(key));
            }
        }
        consumers
    }

    /// Look an instance up by node id.
    pub fn get_node(&self, node_id: &str) -> Option<&ServiceInstance> {
        self.instances
            .values()
            .flatten()
            .find(|instance| instance.node_id == node_id)
    }

    /// Remove an instance entirely: from its service bucket and from
    /// pending. Returns the removed record.
    pub fn remove_node(&mut self, node_id: &str) -> Option<ServiceInstance> {
        let key = self
            .instances
            .iter()
            .find(|(_, bucket)| bucket.iter().any(|i| i.node_id == node_id))
            .map(|(key, _)| key.clone())?;

        let bucket = self.instances.get_mut(&key)?;
        let position = bucket.iter().position(|i| i.node_id == node_id)?;
        let removed = bucket.remove(position);

        if let Some(pending) = self.pending.get_mut(&key) {
            pending.retain(|n| n != node_id);
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::TransportKind;

    fn instance(service: &str, version: &str, node_id: &str, vendors: Vec<ServiceRef>) -> ServiceInstance {
        ServiceInstance {
            service: service.to_string(),
            version: version.to_string(),
            host: "127.0.0.1".to_string(),
            port: 4001,
            node_id: node_id.to_string(),
            kind: TransportKind::Tcp,
            vendors,
        }
    }

    #[test]
    fn registration_marks_instances_pending() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![ServiceRef::new("b", "1")]));

        assert_eq!(repo.get_pending_instances("a", "1"), vec!["n1".to_string()]);
        assert_eq!(repo.get_instances("a", "1").len(), 1);
        assert_eq!(repo.get_vendors("a", "1"), vec![ServiceRef::new("b", "1")]);
    }

    #[test]
    fn dependencies_are_set_once_per_service() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![ServiceRef::new("b", "1")]));
        repo.register_service(instance("a", "1", "n2", vec![ServiceRef::new("c", "9")]));

        // Second instance's declaration does not mutate the service's vendors.
        assert_eq!(repo.get_vendors("a", "1"), vec![ServiceRef::new("b", "1")]);
    }

    #[test]
    fn consumers_and_vendors_are_inverses() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![ServiceRef::new("b", "2")]));
        repo.register_service(instance("b", "2", "n2", vec![]));

        let vendors = repo.get_vendors("a", "1");
        assert!(vendors.contains(&ServiceRef::new("b", "2")));
        let consumers = repo.get_consumers("b", "2");
        assert!(consumers.contains(&ServiceRef::new("a", "1")));
        assert!(repo.get_consumers("a", "1").is_empty());
    }

    #[test]
    fn pending_is_a_subset_of_instances() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![]));
        repo.register_service(instance("a", "1", "n2", vec![]));
        repo.remove_pending_instance("a", "1", "n1");

        let registered: Vec<String> = repo
            .get_instances("a", "1")
            .into_iter()
            .map(|i| i.node_id)
            .collect();
        for pending in repo.get_pending_instances("a", "1") {
            assert!(registered.contains(&pending));
        }
    }

    #[test]
    fn re_pending_an_already_pending_node_is_a_no_op() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![]));
        repo.add_pending_service("a", "1", "n1");

        assert_eq!(repo.get_pending_instances("a", "1"), vec!["n1".to_string()]);
    }

    #[test]
    fn removed_nodes_are_unreachable() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![]));
        repo.register_service(instance("a", "1", "n2", vec![]));

        let removed = repo.remove_node("n1").unwrap();
        assert_eq!(removed.node_id, "n1");
        assert!(repo.get_node("n1").is_none());
        assert!(repo.get_pending_instances("a", "1").iter().all(|n| n != "n1"));
        assert_eq!(repo.get_instances("a", "1").len(), 1);
        assert!(repo.remove_node("n1").is_none());
    }

    #[test]
    fn get_node_finds_instances_across_services() {
        let mut repo = Repository::new();
        repo.register_service(instance("a", "1", "n1", vec![]));
        repo.register_service(instance("b", "7", "n2", vec![]));

        let found = repo.get_node("n2").unwrap();
        assert_eq!(found.service, "b");
        assert_eq!(found.version, "7");
        assert!(repo.get_node("n3").is_none());
    }
}
