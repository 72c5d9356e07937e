//! Process supervision contract.
//!
//! Installing a container means fetching and unpacking its package into an
//! install directory, running the post-unpack task pipeline over that
//! directory, and handing back a controller for the resulting process. These
//! calls are synchronous and may block for a long time; callers on the async
//! runtime move them onto the blocking pool.

mod mock;
mod tasks;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::image::PackageCoordinate;

pub use mock::{MockController, MockProcessManager};
pub use tasks::{
    find_install_dir, ChmodScriptsTask, EnvironmentFileTask, InstallContext, InstallTask,
    InstallTaskPipeline, RemoveFilesTask, ENVIRONMENT_FILE,
};

/// Errors from installing a package.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid install options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unpack failed: {0}")]
    Unpack(String),

    #[error("install task '{task}' failed: {source}")]
    Task {
        task: String,
        #[source]
        source: Box<InstallError>,
    },
}

/// Errors from starting, stopping or probing a process.
#[derive(Debug, Error)]
pub enum ProcessStartError {
    #[error("failed to start process '{id}': {reason}")]
    Start { id: String, reason: String },

    #[error("failed to stop process '{id}': {reason}")]
    Stop { id: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to install and under which identity.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Install identifier; also the install directory name.
    pub id: String,

    /// Human readable process name.
    pub name: String,

    pub coordinate: PackageCoordinate,

    /// Environment written into the installed process's configuration.
    pub environment: BTreeMap<String, String>,

    /// Paths (relative to the install root) removed after unpacking.
    pub post_unpack_remove: Vec<String>,
}

impl InstallOptions {
    /// Options for installing a declared container.
    ///
    /// A blank container name falls back to the artifact id.
    pub fn for_container(container_name: &str, coordinate: PackageCoordinate) -> Self {
        let id = if container_name.trim().is_empty() {
            coordinate.artifact_id.clone()
        } else {
            container_name.to_string()
        };

        Self {
            name: id.clone(),
            id,
            coordinate,
            environment: BTreeMap::new(),
            post_unpack_remove: Vec::new(),
        }
    }

    /// Check the options once, before any filesystem work happens.
    pub fn validate(&self) -> Result<(), InstallError> {
        if self.id.is_empty() {
            return Err(InstallError::InvalidOptions("id is empty".to_string()));
        }
        if self.id == "." || self.id == ".." || self.id.contains(['/', '\\']) {
            return Err(InstallError::InvalidOptions(format!(
                "id '{}' is not a valid directory name",
                self.id
            )));
        }
        Ok(())
    }

    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            name: self.name.clone(),
            environment: self.environment.clone(),
        }
    }
}

/// Configuration handed to every install task.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub name: String,
    pub environment: BTreeMap<String, String>,
}

/// Controls one installed process.
pub trait ProcessController: Send + Sync {
    fn start(&self) -> Result<(), ProcessStartError>;

    fn stop(&self) -> Result<(), ProcessStartError>;

    /// Current process id, if the process is running.
    fn pid(&self) -> Result<Option<u32>, ProcessStartError>;
}

/// Result of a completed installation.
#[derive(Clone)]
pub struct Installation {
    pub install_dir: PathBuf,
    pub controller: Arc<dyn ProcessController>,
}

impl std::fmt::Debug for Installation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Installation")
            .field("install_dir", &self.install_dir)
            .finish_non_exhaustive()
    }
}

/// Installs packages and produces process controllers.
pub trait ProcessManager: Send + Sync {
    fn install(
        &self,
        options: &InstallOptions,
        post_unpack: &InstallTaskPipeline,
    ) -> Result<Installation, InstallError>;
}
