use dashmap::DashMap;
use harbor_core::ServiceRegistration;
use std::sync::Arc;

/// Agent-visible services, as last merged.
///
/// Cheap to clone; every clone reads the same map. Only the service manager
/// writes it, and only while holding its lock, so readers never observe a
/// partially applied merge.
#[derive(Clone, Default)]
pub struct LocalState {
    services: Arc<DashMap<String, ServiceRegistration>>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self, id: &str) -> Option<ServiceRegistration> {
        self.services.get(id).map(|s| s.value().clone())
    }

    /// All services, ordered by ID.
    pub fn services(&self) -> Vec<ServiceRegistration> {
        let mut all: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) fn publish(&self, service: ServiceRegistration) {
        self.services.insert(service.id.clone(), service);
    }

    pub(crate) fn remove(&self, id: &str) -> Option<ServiceRegistration> {
        self.services.remove(id).map(|(_, s)| s)
    }
}
