//! Pod lifecycle events.

use serde::{Deserialize, Serialize};

use crate::Pod;

/// A pod lifecycle notification.
///
/// Add and update are both `Upserted`; a tombstone is `Deleted`. Delivery is
/// at-least-once, so consumers must treat both variants idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PodEvent {
    Upserted { id: String, pod: Pod },
    Deleted { id: String },
}

impl PodEvent {
    pub fn upserted(pod: Pod) -> Self {
        Self::Upserted {
            id: pod.id.clone(),
            pod,
        }
    }

    pub fn deleted(id: impl Into<String>) -> Self {
        Self::Deleted { id: id.into() }
    }

    pub fn pod_id(&self) -> &str {
        match self {
            Self::Upserted { id, .. } | Self::Deleted { id } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = PodEvent::deleted("pod-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "deleted", "id": "pod-1"}));
        assert_eq!(event.pod_id(), "pod-1");

        let event = PodEvent::upserted(Pod::new("pod-2"));
        assert_eq!(event.pod_id(), "pod-2");
    }
}
