//! Configuration for the node agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use podlet_model::{Pod, Service};
use serde::Deserialize;

use crate::image::DEFAULT_GROUP_PREFIX;
use crate::proxy::DEFAULT_SHARDS;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory; installs land under it.
    pub data_dir: PathBuf,

    /// Address recorded on pods declared without one.
    pub node_host: String,

    /// Optional JSON file of pods and services applied at startup.
    pub bootstrap_file: Option<PathBuf>,

    pub reconcile_interval: Duration,

    pub liveness_interval: Duration,

    /// Number of membership shard workers.
    pub membership_shards: usize,

    /// Paths removed from every install after unpacking.
    pub post_unpack_remove: Vec<String>,

    /// Group prefix for docker-style image references.
    pub image_group_prefix: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("PODLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/podlet"));

        let node_host = lookup("PODLET_NODE_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let bootstrap_file = lookup("PODLET_BOOTSTRAP_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let reconcile_interval = Duration::from_millis(parse_or(
            &lookup,
            "PODLET_RECONCILE_INTERVAL_MS",
            5_000,
        )?);
        let liveness_interval = Duration::from_millis(parse_or(
            &lookup,
            "PODLET_LIVENESS_INTERVAL_MS",
            10_000,
        )?);
        if reconcile_interval.is_zero() || liveness_interval.is_zero() {
            anyhow::bail!("reconcile and liveness intervals must be non-zero");
        }

        let membership_shards = parse_or(&lookup, "PODLET_MEMBERSHIP_SHARDS", DEFAULT_SHARDS)?;
        if membership_shards == 0 {
            anyhow::bail!("PODLET_MEMBERSHIP_SHARDS must be at least 1");
        }

        let post_unpack_remove = lookup("PODLET_POST_UNPACK_REMOVE")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let image_group_prefix = lookup("PODLET_IMAGE_GROUP_PREFIX")
            .unwrap_or_else(|| DEFAULT_GROUP_PREFIX.to_string());

        let log_level = lookup("PODLET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            data_dir,
            node_host,
            bootstrap_file,
            reconcile_interval,
            liveness_interval,
            membership_shards,
            post_unpack_remove,
            image_group_prefix,
            log_level,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

/// Pods and services to apply at startup.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Bootstrap {
    pub pods: Vec<Pod>,
    pub services: Vec<Service>,
}

impl Bootstrap {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read bootstrap file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse bootstrap file {}", path.display()))
    }
}
