//! # podlet-model
//!
//! Descriptor documents shared by the podlet node agent and its service router.
//!
//! ## Documents
//!
//! - `Pod`: a node-local group of declared containers with an optional desired
//!   state (the manifest) and an optional current state (status plus
//!   per-container info). Both halves stay absent until first needed.
//! - `Service`: a selector-matched logical endpoint with a declared port.
//! - `PodEvent`: the tagged pod lifecycle notification (`Upserted` | `Deleted`)
//!   consumed by service membership.
//!
//! Field names serialize in camelCase to match the JSON documents the node
//! is bootstrapped from.

mod event;
mod pod;
mod selector;
mod service;

pub use event::PodEvent;
pub use pod::{
    ContainerInfo, ContainerPort, ContainerState, CurrentState, DeclaredContainer, DesiredState,
    Manifest, Pod, PodStatus, Running,
};
pub use selector::LabelSelector;
pub use service::{LoadBalancerKind, Service};
