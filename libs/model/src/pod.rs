//! Pod documents.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pod: declared containers sharing one desired/current state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub id: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_state: Option<DesiredState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_state: Option<CurrentState>,
}

impl Pod {
    /// Create a pod with no state attached yet.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Builder-style label helper, mostly for tests and bootstrap files.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Declared containers, or an empty slice when no manifest exists.
    pub fn declared_containers(&self) -> &[DeclaredContainer] {
        self.desired_state
            .as_ref()
            .and_then(|d| d.manifest.as_ref())
            .map(|m| m.containers.as_slice())
            .unwrap_or(&[])
    }

    /// Address other nodes can reach the pod on (`podIP`, falling back to `host`).
    pub fn address(&self) -> Option<&str> {
        let current = self.current_state.as_ref()?;
        let non_empty = |addr: &&str| !addr.is_empty();
        current
            .pod_ip
            .as_deref()
            .filter(non_empty)
            .or_else(|| current.host.as_deref().filter(non_empty))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
}

/// Ordered container declarations, at most one per name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub containers: Vec<DeclaredContainer>,
}

impl Manifest {
    /// Add a container, replacing any earlier declaration with the same name.
    ///
    /// The new declaration is appended, so a replaced entry moves to the end.
    pub fn upsert_container(&mut self, container: DeclaredContainer) -> &DeclaredContainer {
        self.containers.retain(|c| c.name != container.name);
        self.containers.push(container);
        &self.containers[self.containers.len() - 1]
    }

    pub fn find_container(&self, name: &str) -> Option<&DeclaredContainer> {
        self.containers.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredContainer {
    pub name: String,

    /// Opaque image reference, resolved to a package coordinate by the node.
    #[serde(default)]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl DeclaredContainer {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, container_port: u16, host_port: Option<u16>) -> Self {
        self.ports.push(ContainerPort {
            name: None,
            container_port,
            host_port,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
}

/// Coarse pod status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodStatus {
    Waiting,
    Running,
}

impl PodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "Waiting",
            Self::Running => "Running",
        }
    }
}

impl fmt::Display for PodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,

    /// Tracked containers by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<BTreeMap<String, ContainerInfo>>,
}

impl CurrentState {
    /// Whether a container with this name is already tracked.
    pub fn has_container(&self, name: &str) -> bool {
        self.info
            .as_ref()
            .is_some_and(|info| info.contains_key(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ContainerState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Present only while the container's process is alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<Running>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Running {
    pub started_at: DateTime<Utc>,
}

impl Running {
    pub fn now() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }
}
