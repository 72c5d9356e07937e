//! Ensure-initialized access to a pod's nested state tree.
//!
//! A pod arrives with its desired and current state optional. Each `ensure_*`
//! function attaches the missing piece the first time it is asked for and
//! hands back a reference into the pod itself, so repeated calls observe the
//! same object rather than a fresh default.

use std::collections::BTreeMap;

use podlet_model::{
    ContainerInfo, ContainerState, CurrentState, DesiredState, Manifest, Pod, PodStatus, Running,
};
use thiserror::Error;
use tracing::debug;

/// Errors from state access.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Reject pods without a usable identity.
pub fn check_pod(pod: &Pod) -> Result<(), StateError> {
    if pod.id.trim().is_empty() {
        return Err(StateError::InvalidArgument(
            "pod has an empty identity".to_string(),
        ));
    }
    Ok(())
}

pub fn ensure_desired_state(pod: &mut Pod) -> Result<&mut DesiredState, StateError> {
    check_pod(pod)?;
    Ok(pod.desired_state.get_or_insert_with(DesiredState::default))
}

pub fn ensure_manifest(pod: &mut Pod) -> Result<&mut Manifest, StateError> {
    Ok(ensure_desired_state(pod)?
        .manifest
        .get_or_insert_with(Manifest::default))
}

pub fn ensure_current_state(pod: &mut Pod) -> Result<&mut CurrentState, StateError> {
    check_pod(pod)?;
    Ok(pod.current_state.get_or_insert_with(CurrentState::default))
}

/// The container info map of the current state.
pub fn ensure_container_infos(
    pod: &mut Pod,
) -> Result<&mut BTreeMap<String, ContainerInfo>, StateError> {
    Ok(ensure_current_state(pod)?
        .info
        .get_or_insert_with(BTreeMap::new))
}

/// Reject container names that cannot key the tracked-container map.
pub fn check_container_name(container_name: &str) -> Result<(), StateError> {
    if container_name.trim().is_empty() {
        return Err(StateError::InvalidArgument(
            "container name is empty".to_string(),
        ));
    }
    Ok(())
}

pub fn ensure_container_info<'a>(
    pod: &'a mut Pod,
    container_name: &str,
) -> Result<&'a mut ContainerInfo, StateError> {
    check_container_name(container_name)?;
    Ok(ensure_container_infos(pod)?
        .entry(container_name.to_string())
        .or_default())
}

pub fn ensure_container_state<'a>(
    pod: &'a mut Pod,
    container_name: &str,
) -> Result<&'a mut ContainerState, StateError> {
    Ok(ensure_container_info(pod, container_name)?
        .state
        .get_or_insert_with(ContainerState::default))
}

/// Record whether a container's process is alive.
///
/// Alive sets the pod status to `Running` and attaches a running marker;
/// not alive sets `Waiting` and removes the marker.
pub fn set_container_alive(
    pod: &mut Pod,
    container_name: &str,
    alive: bool,
) -> Result<(), StateError> {
    let status = if alive {
        PodStatus::Running
    } else {
        PodStatus::Waiting
    };
    ensure_current_state(pod)?.status = Some(status);

    let state = ensure_container_state(pod, container_name)?;
    if alive {
        if state.running.is_none() {
            state.running = Some(Running::now());
        }
    } else {
        state.running = None;
    }

    debug!(
        pod_id = %pod.id,
        container = %container_name,
        status = %status,
        "Container liveness recorded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlet_model::DeclaredContainer;

    #[test]
    fn test_ensure_current_state_is_identity_stable() {
        let mut pod = Pod::new("pod-1");
        let first = ensure_current_state(&mut pod).unwrap() as *const CurrentState;
        let second = ensure_current_state(&mut pod).unwrap() as *const CurrentState;
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_ensure_keeps_existing_state() {
        let mut pod = Pod::new("pod-1");
        ensure_current_state(&mut pod).unwrap().host = Some("node-a".to_string());
        assert_eq!(
            ensure_current_state(&mut pod).unwrap().host.as_deref(),
            Some("node-a")
        );

        ensure_manifest(&mut pod)
            .unwrap()
            .upsert_container(DeclaredContainer::new("web", "acme/web:1"));
        assert_eq!(ensure_manifest(&mut pod).unwrap().containers.len(), 1);
        assert_eq!(pod.declared_containers().len(), 1);
    }

    #[test]
    fn test_ensure_container_info_attaches_once() {
        let mut pod = Pod::new("pod-1");
        ensure_container_info(&mut pod, "web").unwrap().pid = Some(42);
        assert_eq!(ensure_container_info(&mut pod, "web").unwrap().pid, Some(42));
        assert!(pod.current_state.as_ref().unwrap().has_container("web"));

        ensure_container_state(&mut pod, "web").unwrap();
        assert!(pod.current_state.unwrap().info.unwrap()["web"]
            .state
            .is_some());
    }

    #[test]
    fn test_empty_identity_rejected() {
        let mut pod = Pod::new("");
        assert!(matches!(
            ensure_desired_state(&mut pod),
            Err(StateError::InvalidArgument(_))
        ));
        assert!(matches!(
            ensure_current_state(&mut pod),
            Err(StateError::InvalidArgument(_))
        ));
        assert!(pod.current_state.is_none());
    }

    #[test]
    fn test_set_container_alive_toggles_marker() {
        let mut pod = Pod::new("pod-1");

        set_container_alive(&mut pod, "c", true).unwrap();
        let current = pod.current_state.as_ref().unwrap();
        assert_eq!(current.status, Some(PodStatus::Running));
        assert!(current.info.as_ref().unwrap()["c"]
            .state
            .as_ref()
            .unwrap()
            .running
            .is_some());

        set_container_alive(&mut pod, "c", false).unwrap();
        let current = pod.current_state.as_ref().unwrap();
        assert_eq!(current.status, Some(PodStatus::Waiting));
        assert!(current.info.as_ref().unwrap()["c"]
            .state
            .as_ref()
            .unwrap()
            .running
            .is_none());
    }

    #[test]
    fn test_alive_twice_keeps_start_time() {
        let mut pod = Pod::new("pod-1");
        set_container_alive(&mut pod, "c", true).unwrap();
        let started = ensure_container_state(&mut pod, "c")
            .unwrap()
            .running
            .clone();
        set_container_alive(&mut pod, "c", true).unwrap();
        assert_eq!(ensure_container_state(&mut pod, "c").unwrap().running, started);
    }
}
