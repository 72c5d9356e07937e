//! Service documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Backend selection strategy requested by a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    RoundRobin,
    Random,
}

/// A named, selector-matched logical endpoint.
///
/// The port fields are kept as raw integers; they are validated when the
/// router builds a service instance from the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    /// Port the backing containers listen on; defaults to `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerKind>,
}

impl Service {
    pub fn new(id: impl Into<String>, port: i64) -> Self {
        Self {
            id: id.into(),
            port: Some(port),
            ..Default::default()
        }
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}
