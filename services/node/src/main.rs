//! podlet node agent
//!
//! Applies the bootstrap pods and services, then keeps the node converged
//! until interrupted.
//!
//! - **Pod Manager**: owns pod state and publishes lifecycle events
//! - **Reconciler**: periodically creates missing containers and probes liveness
//! - **Membership Tracker**: keeps each service's backend set current

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use podlet_node::config::{Bootstrap, Config};
use podlet_node::image::DefaultImageResolver;
use podlet_node::process::MockProcessManager;
use podlet_node::reconciler::{Reconciler, ReconcilerConfig};
use podlet_node::{ContainerReconciler, MembershipTracker, PodManager};

/// Capacity of the pod event feed.
const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting podlet node agent");
    info!(
        data_dir = %config.data_dir.display(),
        node_host = %config.node_host,
        membership_shards = config.membership_shards,
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // No unpacker ships with the agent yet; installs are simulated on disk.
    let process_manager = Arc::new(MockProcessManager::new(&config.data_dir));
    let resolver = Arc::new(DefaultImageResolver::new(config.image_group_prefix.clone()));
    let container_reconciler = Arc::new(
        ContainerReconciler::new(process_manager, resolver)
            .with_post_unpack_remove(config.post_unpack_remove.clone()),
    );

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let pod_manager = Arc::new(
        PodManager::new(container_reconciler, events_tx).with_node_host(config.node_host.clone()),
    );

    let tracker = Arc::new(MembershipTracker::spawn(config.membership_shards));
    let tracker_handle = tokio::spawn({
        let tracker = Arc::clone(&tracker);
        async move { tracker.run(events_rx).await }
    });

    if let Some(path) = &config.bootstrap_file {
        let bootstrap = Bootstrap::load(path)?;
        apply_bootstrap(&pod_manager, &tracker, bootstrap).await;
    }

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        Arc::clone(&pod_manager),
        ReconcilerConfig {
            reconcile_interval: config.reconcile_interval,
            liveness_interval: config.liveness_interval,
        },
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            } else {
                info!("Reconciler exited");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    for pod_id in pod_manager.pod_ids().await {
        pod_manager.delete_pod(&pod_id).await;
    }
    if let Err(e) = tracker.flush().await {
        warn!(error = %e, "Membership tracker did not drain");
    }
    tracker_handle.abort();

    info!("Node agent shutdown complete");
    Ok(())
}

/// Apply bootstrap documents. Bad entries are logged and skipped.
async fn apply_bootstrap(pod_manager: &PodManager, tracker: &MembershipTracker, bootstrap: Bootstrap) {
    for service in bootstrap.services {
        let service_id = service.id.clone();
        if let Err(e) = tracker.register_service(service).await {
            warn!(service_id = %service_id, error = %e, "Skipping invalid service");
        }
    }

    for pod in bootstrap.pods {
        let pod_id = pod.id.clone();
        if let Err(e) = pod_manager.apply_pod(pod).await {
            warn!(pod_id = %pod_id, error = %e, "Skipping invalid pod");
        }
    }

    info!(
        pods = pod_manager.pod_count().await,
        services = tracker.service_ids().len(),
        "Bootstrap applied"
    );
}
