//! Backend endpoints derived from pods.

use std::fmt;

use podlet_model::Pod;
use thiserror::Error;

/// Why a matching pod could not be turned into a backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("pod '{pod_id}' has no address yet")]
    NoAddress { pod_id: String },

    #[error("pod '{pod_id}' declares no container listening on port {port}")]
    NoMatchingPort { pod_id: String, port: u16 },
}

/// A pod's matched container/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendEndpoint {
    pub pod_id: String,
    pub container_name: String,
    pub host: String,
    pub port: u16,
}

impl BackendEndpoint {
    /// Build the endpoint serving `container_port` on `pod`.
    ///
    /// The first declared container with a matching port wins. Traffic goes to
    /// the host port when one is mapped, else to the container port itself.
    ///
    /// Container liveness is not consulted: a pod stays routable from its
    /// first upsert until it is deleted, even while its process is down.
    pub fn for_pod(pod: &Pod, container_port: u16) -> Result<Self, EndpointError> {
        let host = pod.address().ok_or_else(|| EndpointError::NoAddress {
            pod_id: pod.id.clone(),
        })?;

        pod.declared_containers()
            .iter()
            .find_map(|container| {
                container
                    .ports
                    .iter()
                    .find(|p| p.container_port == container_port)
                    .map(|p| Self {
                        pod_id: pod.id.clone(),
                        container_name: container.name.clone(),
                        host: host.to_string(),
                        port: p.host_port.unwrap_or(p.container_port),
                    })
            })
            .ok_or_else(|| EndpointError::NoMatchingPort {
                pod_id: pod.id.clone(),
                port: container_port,
            })
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.pod_id, self.container_name, self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlet_model::{CurrentState, DeclaredContainer, DesiredState, Manifest};

    fn pod(host: Option<&str>, pod_ip: Option<&str>, containers: Vec<DeclaredContainer>) -> Pod {
        Pod {
            desired_state: Some(DesiredState {
                manifest: Some(Manifest { containers }),
            }),
            current_state: Some(CurrentState {
                host: host.map(str::to_string),
                pod_ip: pod_ip.map(str::to_string),
                ..Default::default()
            }),
            ..Pod::new("pod-1")
        }
    }

    #[test]
    fn test_host_port_preferred() {
        let pod = pod(
            Some("10.0.0.5"),
            None,
            vec![
                DeclaredContainer::new("sidecar", "acme/proxy:1").with_port(9090, None),
                DeclaredContainer::new("web", "acme/web:1").with_port(8080, Some(31080)),
            ],
        );

        let endpoint = BackendEndpoint::for_pod(&pod, 8080).unwrap();
        assert_eq!(endpoint.container_name, "web");
        assert_eq!(endpoint.port, 31080);
        assert_eq!(endpoint.authority(), "10.0.0.5:31080");
    }

    #[test]
    fn test_pod_ip_preferred_over_host() {
        let pod = pod(
            Some("node-a"),
            Some("fd00::5"),
            vec![DeclaredContainer::new("web", "acme/web:1").with_port(8080, None)],
        );

        let endpoint = BackendEndpoint::for_pod(&pod, 8080).unwrap();
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.authority(), "[fd00::5]:8080");
    }

    #[test]
    fn test_missing_address_or_port() {
        let containers = vec![DeclaredContainer::new("web", "acme/web:1").with_port(8080, None)];

        let err = BackendEndpoint::for_pod(&pod(None, None, containers.clone()), 8080).unwrap_err();
        assert!(matches!(err, EndpointError::NoAddress { .. }));

        let err = BackendEndpoint::for_pod(&pod(Some("h"), None, containers), 9000).unwrap_err();
        assert_eq!(
            err,
            EndpointError::NoMatchingPort {
                pod_id: "pod-1".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn test_endpoint_ignores_liveness() {
        let mut pod = pod(
            Some("10.0.0.5"),
            None,
            vec![DeclaredContainer::new("web", "acme/web:1").with_port(8080, None)],
        );
        let dead = podlet_model::ContainerInfo::default();
        pod.current_state
            .as_mut()
            .unwrap()
            .info
            .get_or_insert_with(Default::default)
            .insert("web".to_string(), dead);

        let endpoint = BackendEndpoint::for_pod(&pod, 8080).unwrap();
        assert_eq!(endpoint.container_name, "web");
        assert_eq!(endpoint.authority(), "10.0.0.5:8080");
    }
}
