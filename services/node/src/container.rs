//! Container reconciliation.
//!
//! Diffs a pod's declared containers against the containers tracked in its
//! current state and drives each missing one through
//! `Declared -> Installing -> Started -> Running | Waiting`.
//!
//! - Installation and process start block, so they run on the blocking pool
//!   and never on the task that serves membership or routing.
//! - A failure creating one container is reported and the remaining declared
//!   containers are still attempted. There is no retry here; the periodic
//!   reconcile loop picks failed containers up again on its next pass, since
//!   a failed container is never added to the tracked set.

use std::path::PathBuf;
use std::sync::Arc;

use podlet_model::{DeclaredContainer, Pod};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::image::{ImageResolver, ResolutionError};
use crate::process::{
    InstallError, InstallOptions, InstallTaskPipeline, ProcessController, ProcessManager,
    ProcessStartError,
};
use crate::state::{self, StateError};

/// Errors from creating a single container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot resolve image for container '{container}': {source}")]
    Resolution {
        container: String,
        #[source]
        source: ResolutionError,
    },

    #[error("cannot install container '{container}': {source}")]
    Install {
        container: String,
        #[source]
        source: InstallError,
    },

    #[error("cannot start container '{container}': {source}")]
    ProcessStart {
        container: String,
        #[source]
        source: ProcessStartError,
    },

    #[error("install task for container '{container}' did not complete: {reason}")]
    Aborted { container: String, reason: String },
}

/// Outcome of a successful creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    /// Started and reported a live pid.
    Running { pid: u32 },
    /// Started but no live pid was reported.
    Waiting,
}

impl ContainerPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

/// A container that made it through install and start.
#[derive(Clone)]
pub struct StartedContainer {
    pub name: String,
    pub phase: ContainerPhase,
    pub install_dir: PathBuf,
    pub controller: Arc<dyn ProcessController>,
}

impl std::fmt::Debug for StartedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedContainer")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("install_dir", &self.install_dir)
            .finish_non_exhaustive()
    }
}

/// Result of one reconciliation pass over a pod.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub started: Vec<StartedContainer>,
    pub failed: Vec<(String, ContainerError)>,
    /// Declared containers that were already tracked.
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Creates missing containers for pods.
pub struct ContainerReconciler {
    process_manager: Arc<dyn ProcessManager>,
    resolver: Arc<dyn ImageResolver>,
    post_unpack_remove: Vec<String>,
}

impl ContainerReconciler {
    pub fn new(process_manager: Arc<dyn ProcessManager>, resolver: Arc<dyn ImageResolver>) -> Self {
        Self {
            process_manager,
            resolver,
            post_unpack_remove: Vec::new(),
        }
    }

    /// Paths removed from every install after unpacking.
    pub fn with_post_unpack_remove(mut self, paths: Vec<String>) -> Self {
        self.post_unpack_remove = paths;
        self
    }

    /// Create every declared container that the pod's current state does not
    /// track yet.
    pub async fn reconcile(&self, pod: &mut Pod, declared: &[DeclaredContainer]) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for container in declared {
            let tracked = pod
                .current_state
                .as_ref()
                .is_some_and(|current| current.has_container(&container.name));
            if tracked {
                report.unchanged += 1;
                continue;
            }

            match self.create_container(container, pod).await {
                Ok(started) => report.started.push(started),
                Err(e) => {
                    warn!(
                        pod_id = %pod.id,
                        container = %container.name,
                        error = %e,
                        "Failed to create container"
                    );
                    report.failed.push((container.name.clone(), e));
                }
            }
        }

        if !report.started.is_empty() || !report.failed.is_empty() {
            info!(
                pod_id = %pod.id,
                started = report.started.len(),
                failed = report.failed.len(),
                unchanged = report.unchanged,
                "Pod reconciled"
            );
        }
        report
    }

    /// Install and start one container, then record its liveness on the pod.
    pub async fn create_container(
        &self,
        container: &DeclaredContainer,
        pod: &mut Pod,
    ) -> Result<StartedContainer, ContainerError> {
        state::check_pod(pod)?;
        // Nothing is installed for a container that could never be tracked.
        state::check_container_name(&container.name)?;
        let name = container.name.clone();

        if container.image.is_empty() {
            return Err(ContainerError::Resolution {
                container: name,
                source: ResolutionError::Empty,
            });
        }
        let coordinate =
            self.resolver
                .resolve(&container.image)
                .map_err(|source| ContainerError::Resolution {
                    container: name.clone(),
                    source,
                })?;

        let mut options = InstallOptions::for_container(&name, coordinate);
        options.environment = container.env.clone();
        options.post_unpack_remove = self.post_unpack_remove.clone();
        options
            .validate()
            .map_err(|source| ContainerError::Install {
                container: name.clone(),
                source,
            })?;

        info!(
            pod_id = %pod.id,
            container = %name,
            coordinate = %options.coordinate,
            "Installing container"
        );

        let process_manager = Arc::clone(&self.process_manager);
        let task_name = name.clone();
        let (installation, pid) = tokio::task::spawn_blocking(move || {
            let pipeline = InstallTaskPipeline::post_unpack(options.post_unpack_remove.clone());
            let installation = process_manager
                .install(&options, &pipeline)
                .map_err(|source| ContainerError::Install {
                    container: task_name.clone(),
                    source,
                })?;

            debug!(
                container = %task_name,
                install_dir = %installation.install_dir.display(),
                "Installed container, starting process"
            );

            let start_err = |source| ContainerError::ProcessStart {
                container: task_name.clone(),
                source,
            };
            installation.controller.start().map_err(start_err)?;
            let pid = installation.controller.pid().map_err(start_err)?;
            Ok::<_, ContainerError>((installation, pid))
        })
        .await
        .map_err(|e| ContainerError::Aborted {
            container: name.clone(),
            reason: e.to_string(),
        })??;

        let live_pid = pid.filter(|p| *p > 0);
        if let Err(e) = record_started(pod, &name, live_pid) {
            let controller = Arc::clone(&installation.controller);
            if let Ok(Err(stop_err)) = tokio::task::spawn_blocking(move || controller.stop()).await {
                warn!(container = %name, error = %stop_err, "Error stopping untracked container");
            }
            return Err(e.into());
        }

        let phase = match live_pid {
            Some(pid) => ContainerPhase::Running { pid },
            None => ContainerPhase::Waiting,
        };
        info!(
            pod_id = %pod.id,
            container = %name,
            phase = ?phase,
            "Container started"
        );

        Ok(StartedContainer {
            name,
            phase,
            install_dir: installation.install_dir,
            controller: installation.controller,
        })
    }
}

fn record_started(pod: &mut Pod, name: &str, pid: Option<u32>) -> Result<(), StateError> {
    state::set_container_alive(pod, name, pid.is_some())?;
    state::ensure_container_info(pod, name)?.pid = pid;
    Ok(())
}
