//! podlet node agent library
//!
//! The node agent runs on each host and keeps local pods converged: every
//! declared container is resolved to a package, installed, started and
//! probed. It also tracks which pods back which services and picks a backend
//! per request.
//!
//! ## Architecture
//!
//! ```text
//! Bootstrap / API -> PodManager ── ContainerReconciler -> ProcessManager
//!                        │
//!                        └── PodEvent feed -> MembershipTracker -> ServiceInstance
//! ```
//!
//! ## Modules
//!
//! - `state`: ensure-initialized access to a pod's state tree
//! - `image`: image reference to package coordinate resolution
//! - `process`: install/start contract, post-unpack task pipeline, mock supervisor
//! - `container`: per-pod container reconciliation
//! - `pods`: pod ownership, lifecycle events, liveness
//! - `reconciler`: periodic reconcile and liveness loop
//! - `proxy`: service membership and load balancing

pub mod config;
pub mod container;
pub mod image;
pub mod pods;
pub mod process;
pub mod proxy;
pub mod reconciler;
pub mod state;

pub use container::{ContainerError, ContainerReconciler, ReconcileReport};
pub use pods::PodManager;
pub use proxy::{MembershipTracker, ServiceInstance};
