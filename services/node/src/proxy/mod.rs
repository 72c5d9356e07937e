//! Service membership and backend selection.
//!
//! ## Architecture
//!
//! ```text
//! PodManager -> PodEvent feed -> MembershipTracker -> shard workers
//!                                                         |
//!                                          ServiceInstance::apply (per service)
//!                                                         |
//!                        select_backend -> LoadBalancer over backend snapshot
//! ```
//!
//! Forwarding traffic to the selected backend is left to the caller.

mod balancer;
mod endpoint;
mod membership;
mod service;

pub use balancer::{
    for_kind, BalancerError, LoadBalancer, RandomLoadBalancer, RoundRobinLoadBalancer,
};
pub use endpoint::{BackendEndpoint, EndpointError};
pub use membership::{MembershipTracker, RouteError, DEFAULT_SHARDS};
pub use service::{ConfigurationError, ServiceInstance};
