//! Service instances and their backend sets.
//!
//! Membership writes publish a fresh copy of the backend list; selection
//! reads whichever snapshot is current without locking, so a balancer never
//! sees a half-applied update.

use std::sync::Arc;

use arc_swap::ArcSwap;
use podlet_model::{LabelSelector, Pod, PodEvent, Service};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::balancer::{self, BalancerError, LoadBalancer};
use super::BackendEndpoint;

/// Errors in a service definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("service id is empty")]
    MissingId,

    #[error("service '{0}' has no port")]
    MissingPort(String),

    #[error("service '{service_id}' has invalid {field} {value}")]
    InvalidPort {
        service_id: String,
        field: &'static str,
        value: i64,
    },

    #[error("service '{0}' has no selector")]
    MissingSelector(String),

    #[error("service '{0}' has an empty selector")]
    EmptySelector(String),
}

/// A validated service plus its live backend set.
pub struct ServiceInstance {
    service: Service,
    selector: LabelSelector,
    port: u16,
    container_port: u16,
    load_balancer: Box<dyn LoadBalancer>,
    /// Sorted by pod id, at most one endpoint per pod.
    backends: ArcSwap<Vec<BackendEndpoint>>,
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("id", &self.service.id)
            .field("port", &self.port)
            .field("container_port", &self.container_port)
            .field("load_balancer", &self.load_balancer)
            .field("backends", &self.backends.load().len())
            .finish()
    }
}

fn check_port(service_id: &str, field: &'static str, value: i64) -> Result<u16, ConfigurationError> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigurationError::InvalidPort {
            service_id: service_id.to_string(),
            field,
            value,
        }),
    }
}

impl ServiceInstance {
    /// Validate a service and bind the balancer it asks for (round robin by
    /// default).
    pub fn new(service: Service) -> Result<Self, ConfigurationError> {
        if service.id.trim().is_empty() {
            return Err(ConfigurationError::MissingId);
        }
        let id = service.id.as_str();

        let port = service
            .port
            .ok_or_else(|| ConfigurationError::MissingPort(id.to_string()))?;
        let port = check_port(id, "port", port)?;
        let container_port = match service.container_port {
            Some(value) => check_port(id, "container port", value)?,
            None => port,
        };

        let selector = match &service.selector {
            None => return Err(ConfigurationError::MissingSelector(id.to_string())),
            Some(terms) if terms.is_empty() => {
                return Err(ConfigurationError::EmptySelector(id.to_string()))
            }
            Some(terms) => LabelSelector::new(terms.clone()),
        };

        let load_balancer = balancer::for_kind(service.load_balancer.unwrap_or_default());

        Ok(Self {
            service,
            selector,
            port,
            container_port,
            load_balancer,
            backends: ArcSwap::from_pointee(Vec::new()),
        })
    }

    /// Swap in a different selection strategy.
    pub fn with_load_balancer(mut self, load_balancer: Box<dyn LoadBalancer>) -> Self {
        self.load_balancer = load_balancer;
        self
    }

    pub fn id(&self) -> &str {
        &self.service.id
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn container_port(&self) -> u16 {
        self.container_port
    }

    pub fn selector(&self) -> &LabelSelector {
        &self.selector
    }

    /// Apply a pod add or update.
    ///
    /// A matching pod's endpoint replaces whatever was stored for `pod_id`.
    /// A pod that does not match, or whose endpoint cannot be built, leaves
    /// the set untouched; only a delete removes an entry. Returns whether the
    /// set changed.
    pub fn entity_changed(&self, pod_id: &str, pod: &Pod) -> bool {
        if !self.selector.matches(pod) {
            return false;
        }

        let endpoint = match BackendEndpoint::for_pod(pod, self.container_port) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(
                    service_id = %self.service.id,
                    pod_id = %pod_id,
                    error = %e,
                    "Skipping pod without usable endpoint"
                );
                return false;
            }
        };
        // Keyed by the event's id, not whatever the document says.
        let endpoint = BackendEndpoint {
            pod_id: pod_id.to_string(),
            ..endpoint
        };

        self.backends.rcu(|current| {
            let mut next = current.to_vec();
            match next.binary_search_by(|b| b.pod_id.as_str().cmp(pod_id)) {
                Ok(idx) => next[idx] = endpoint.clone(),
                Err(idx) => next.insert(idx, endpoint.clone()),
            }
            next
        });

        debug!(
            service_id = %self.service.id,
            backend = %endpoint,
            "Backend upserted"
        );
        true
    }

    /// Apply a pod delete. Returns whether an entry was removed.
    pub fn entity_deleted(&self, pod_id: &str) -> bool {
        let previous = self.backends.rcu(|current| {
            current
                .iter()
                .filter(|b| b.pod_id != pod_id)
                .cloned()
                .collect::<Vec<_>>()
        });

        let removed = previous.iter().any(|b| b.pod_id == pod_id);
        if removed {
            info!(service_id = %self.service.id, pod_id = %pod_id, "Backend removed");
        }
        removed
    }

    /// Route a tagged pod event to the matching handler.
    pub fn apply(&self, event: &PodEvent) -> bool {
        match event {
            PodEvent::Upserted { id, pod } => self.entity_changed(id, pod),
            PodEvent::Deleted { id } => self.entity_deleted(id),
        }
    }

    /// Current backend snapshot.
    pub fn list_backends(&self) -> Arc<Vec<BackendEndpoint>> {
        self.backends.load_full()
    }

    pub fn backend(&self, pod_id: &str) -> Option<BackendEndpoint> {
        self.backends
            .load()
            .iter()
            .find(|b| b.pod_id == pod_id)
            .cloned()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.load().len()
    }

    /// Pick one backend with the bound balancer.
    pub fn select_backend(&self) -> Result<BackendEndpoint, BalancerError> {
        let snapshot = self.backends.load();
        self.load_balancer.select(snapshot.as_slice()).cloned()
    }
}
