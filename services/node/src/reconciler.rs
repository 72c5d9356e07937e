//! Reconciliation loop for converging node state.
//!
//! The reconciler:
//! - Periodically creates declared containers that are not running yet
//! - Periodically probes started containers and records their liveness

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::pods::PodManager;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between container reconcile passes.
    pub reconcile_interval: Duration,

    /// Interval between liveness probes.
    pub liveness_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(10),
        }
    }
}

/// Reconciler for converging node state.
pub struct Reconciler {
    pod_manager: Arc<PodManager>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(pod_manager: Arc<PodManager>, config: ReconcilerConfig) -> Self {
        Self {
            pod_manager,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_ms = self.config.reconcile_interval.as_millis() as u64,
            liveness_interval_ms = self.config.liveness_interval.as_millis() as u64,
            "Starting reconciliation loop"
        );

        let mut reconcile_interval = tokio::time::interval(self.config.reconcile_interval);
        let mut liveness_interval = tokio::time::interval(self.config.liveness_interval);

        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    self.reconcile().await;
                }
                _ = liveness_interval.tick() => {
                    debug!("Checking container liveness");
                    self.pod_manager.check_liveness().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Kick off a reconciliation pass.
    ///
    /// Each pod is reconciled on its own task; a pod still busy from an
    /// earlier tick is skipped.
    pub async fn reconcile(&self) {
        let spawned = self.pod_manager.spawn_reconciles().await;
        debug!(pods = spawned, "Reconciliation pass started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerReconciler;
    use crate::image::DefaultImageResolver;
    use crate::process::MockProcessManager;
    use podlet_model::{DeclaredContainer, Pod, PodEvent};
    use tokio::sync::mpsc;

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.liveness_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_starts_containers_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Arc::new(ContainerReconciler::new(
            Arc::new(MockProcessManager::new(dir.path())),
            Arc::new(DefaultImageResolver::default()),
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let manager = Arc::new(PodManager::new(reconciler, tx));

        let mut pod = Pod::new("pod-1");
        crate::state::ensure_manifest(&mut pod)
            .unwrap()
            .upsert_container(DeclaredContainer::new("web", "acme/web:1.0"));
        manager.apply_pod(pod).await.unwrap();
        assert!(matches!(rx.recv().await, Some(PodEvent::Upserted { .. })));

        let loop_ = Reconciler::new(
            Arc::clone(&manager),
            ReconcilerConfig {
                reconcile_interval: Duration::from_millis(10),
                liveness_interval: Duration::from_millis(10),
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { loop_.run(shutdown_rx).await });

        // The first tick fires immediately and starts the container.
        let event = rx.recv().await.unwrap();
        let PodEvent::Upserted { pod, .. } = event else {
            panic!("expected upsert");
        };
        assert!(pod.current_state.unwrap().has_container("web"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
