//! Backend selection strategies.
//!
//! A balancer picks one endpoint from the snapshot it is handed at call time.
//! It never holds on to the set, so a service can swap its backends between
//! calls without coordinating with the balancer.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use podlet_model::LoadBalancerKind;
use rand::Rng;
use thiserror::Error;

use super::BackendEndpoint;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum BalancerError {
    /// The backend set was empty at call time. Expected during rollouts.
    #[error("no available backends")]
    NoAvailableBackends,
}

/// Picks a backend from a backend set.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    fn select<'a>(
        &self,
        backends: &'a [BackendEndpoint],
    ) -> Result<&'a BackendEndpoint, BalancerError>;
}

/// Cycles through the set in order, one step per call.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    cursor: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select<'a>(
        &self,
        backends: &'a [BackendEndpoint],
    ) -> Result<&'a BackendEndpoint, BalancerError> {
        // An empty set must not advance the cursor.
        if backends.is_empty() {
            return Err(BalancerError::NoAvailableBackends);
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % backends.len();
        Ok(&backends[idx])
    }
}

/// Picks uniformly at random.
#[derive(Debug, Default)]
pub struct RandomLoadBalancer;

impl LoadBalancer for RandomLoadBalancer {
    fn select<'a>(
        &self,
        backends: &'a [BackendEndpoint],
    ) -> Result<&'a BackendEndpoint, BalancerError> {
        if backends.is_empty() {
            return Err(BalancerError::NoAvailableBackends);
        }
        let idx = rand::rng().random_range(0..backends.len());
        Ok(&backends[idx])
    }
}

/// Balancer for a service's requested strategy.
pub fn for_kind(kind: LoadBalancerKind) -> Box<dyn LoadBalancer> {
    match kind {
        LoadBalancerKind::RoundRobin => Box::new(RoundRobinLoadBalancer::new()),
        LoadBalancerKind::Random => Box::new(RandomLoadBalancer),
    }
}
