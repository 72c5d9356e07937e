//! Pod manager for tracking and reconciling local pods.
//!
//! The pod manager:
//! - Owns every pod's state tree, each behind its own lock
//! - Merges incoming pod declarations into the stored desired state
//! - Runs container reconciliation per pod, concurrently across pods
//! - Publishes pod lifecycle events for service membership
//!
//! Events for a pod are sent while that pod's lock is held, so they leave the
//! manager in the order the state changes happened.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use podlet_model::{Pod, PodEvent};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::container::{ContainerReconciler, ReconcileReport};
use crate::process::ProcessController;
use crate::state::{self, StateError};

/// A pod plus the controllers of the containers started for it.
struct PodEntry {
    pod: Pod,
    processes: HashMap<String, Arc<dyn ProcessController>>,
    /// Set once the pod has been deleted; late holders of the entry must not
    /// publish after the tombstone.
    deleted: bool,
}

/// Totals from a reconcile pass over all pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub pods: usize,
    pub started: usize,
    pub failed: usize,
}

/// Pod manager.
pub struct PodManager {
    reconciler: Arc<ContainerReconciler>,

    /// Pods by id.
    pods: RwLock<HashMap<String, Arc<Mutex<PodEntry>>>>,

    /// Lifecycle event feed.
    events: mpsc::Sender<PodEvent>,

    /// Address recorded on pods that arrive without one.
    node_host: Option<String>,

    /// Pods with a background reconcile still running.
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

/// Marks a pod as being reconciled in the background until dropped.
struct InFlight {
    pod_id: String,
    set: Arc<StdMutex<HashSet<String>>>,
}

impl InFlight {
    fn claim(set: &Arc<StdMutex<HashSet<String>>>, pod_id: &str) -> Option<Self> {
        let mut ids = set.lock().unwrap_or_else(|e| e.into_inner());
        if !ids.insert(pod_id.to_string()) {
            return None;
        }
        Some(Self {
            pod_id: pod_id.to_string(),
            set: Arc::clone(set),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut ids = self.set.lock().unwrap_or_else(|e| e.into_inner());
        ids.remove(&self.pod_id);
    }
}

impl PodManager {
    pub fn new(reconciler: Arc<ContainerReconciler>, events: mpsc::Sender<PodEvent>) -> Self {
        Self {
            reconciler,
            pods: RwLock::new(HashMap::new()),
            events,
            node_host: None,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Record `host` as the address of pods declared without one.
    pub fn with_node_host(mut self, host: impl Into<String>) -> Self {
        self.node_host = Some(host.into());
        self
    }

    pub async fn pod_count(&self) -> usize {
        self.pods.read().await.len()
    }

    pub async fn pod_ids(&self) -> Vec<String> {
        self.pods.read().await.keys().cloned().collect()
    }

    /// Snapshot of a pod's current document.
    pub async fn get_pod(&self, pod_id: &str) -> Option<Pod> {
        let entry = self.entry(pod_id).await?;
        let entry = entry.lock().await;
        Some(entry.pod.clone())
    }

    async fn entry(&self, pod_id: &str) -> Option<Arc<Mutex<PodEntry>>> {
        self.pods.read().await.get(pod_id).cloned()
    }

    async fn publish(&self, event: PodEvent) {
        let pod_id = event.pod_id().to_string();
        if self.events.send(event).await.is_err() {
            debug!(pod_id = %pod_id, "No pod event subscriber");
        }
    }

    /// Declare a pod.
    ///
    /// The first declaration stores the pod as given. Later declarations
    /// replace its labels and addresses and upsert each declared container
    /// into the stored manifest, leaving tracked current state alone. A
    /// declaration that races a delete waits for the tombstone to be
    /// published and then declares the pod afresh.
    pub async fn apply_pod(&self, pod: Pod) -> Result<(), StateError> {
        state::check_pod(&pod)?;
        let pod_id = pod.id.clone();
        let mut pod = Some(pod);

        loop {
            let (entry, created) = {
                let mut pods = self.pods.write().await;
                match pods.get(&pod_id) {
                    Some(entry) => (Arc::clone(entry), false),
                    None => {
                        let Some(pod) = pod.take() else {
                            return Ok(());
                        };
                        let entry = Arc::new(Mutex::new(PodEntry {
                            pod,
                            processes: HashMap::new(),
                            deleted: false,
                        }));
                        pods.insert(pod_id.clone(), Arc::clone(&entry));
                        (entry, true)
                    }
                }
            };

            let mut entry = entry.lock().await;
            if entry.deleted {
                if created {
                    // Deleted right after insertion; the tombstone is already out.
                    return Ok(());
                }
                debug!(pod_id = %pod_id, "Pod deleted while waiting, declaring again");
                continue;
            }

            if created {
                if let Some(host) = &self.node_host {
                    if entry.pod.address().is_none() {
                        state::ensure_current_state(&mut entry.pod)?.host = Some(host.clone());
                    }
                }
                info!(
                    pod_id = %pod_id,
                    container_count = entry.pod.declared_containers().len(),
                    "Pod added"
                );
            } else if let Some(update) = pod.take() {
                merge_declaration(&mut entry.pod, update)?;
                debug!(
                    pod_id = %pod_id,
                    container_count = entry.pod.declared_containers().len(),
                    "Pod updated"
                );
            }

            self.publish(PodEvent::upserted(entry.pod.clone())).await;
            return Ok(());
        }
    }

    /// Run container reconciliation for one pod.
    ///
    /// Returns `None` if the pod is unknown or was deleted meanwhile.
    pub async fn reconcile_pod(&self, pod_id: &str) -> Option<ReconcileReport> {
        let entry = self.entry(pod_id).await?;
        let mut entry = entry.lock().await;
        if entry.deleted {
            return None;
        }

        let declared = entry.pod.declared_containers().to_vec();
        let report = self.reconciler.reconcile(&mut entry.pod, &declared).await;

        for started in &report.started {
            entry
                .processes
                .insert(started.name.clone(), Arc::clone(&started.controller));
        }

        if !report.started.is_empty() {
            self.publish(PodEvent::upserted(entry.pod.clone())).await;
        }
        Some(report)
    }

    /// Reconcile every known pod concurrently.
    pub async fn reconcile_all(self: &Arc<Self>) -> ReconcileSummary {
        let mut tasks = JoinSet::new();
        for pod_id in self.pod_ids().await {
            let manager = Arc::clone(self);
            tasks.spawn(async move { manager.reconcile_pod(&pod_id).await });
        }

        let mut summary = ReconcileSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(report)) => {
                    summary.pods += 1;
                    summary.started += report.started.len();
                    summary.failed += report.failed.len();
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "Pod reconcile task panicked"),
            }
        }
        summary
    }

    /// Start a background reconcile for every pod that does not already
    /// have one running, and return how many were started.
    ///
    /// Unlike [`reconcile_all`](Self::reconcile_all) this does not wait, so
    /// a pod whose install is slow never holds up the other pods or the
    /// caller's next tick.
    pub async fn spawn_reconciles(self: &Arc<Self>) -> usize {
        let mut spawned = 0;
        for pod_id in self.pod_ids().await {
            let Some(claim) = InFlight::claim(&self.in_flight, &pod_id) else {
                debug!(pod_id = %pod_id, "Reconcile already in flight");
                continue;
            };

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let _claim = claim;
                match manager.reconcile_pod(&pod_id).await {
                    Some(report) if !report.is_clean() => warn!(
                        pod_id = %pod_id,
                        started = report.started.len(),
                        failed = report.failed.len(),
                        "Reconciliation left containers not created"
                    ),
                    Some(report) => debug!(
                        pod_id = %pod_id,
                        started = report.started.len(),
                        "Pod reconciled"
                    ),
                    None => {}
                }
            });
            spawned += 1;
        }
        spawned
    }

    /// Delete a pod, stopping its processes.
    ///
    /// The pod's lock is held until the tombstone is published and the entry
    /// is gone from the map, so a concurrent declaration of the same id
    /// cannot publish ahead of the delete.
    pub async fn delete_pod(&self, pod_id: &str) -> bool {
        let Some(entry) = self.entry(pod_id).await else {
            return false;
        };

        let mut guard = entry.lock().await;
        if guard.deleted {
            return false;
        }
        guard.deleted = true;

        let processes: Vec<_> = guard.processes.drain().collect();
        for (name, controller) in processes {
            let result = tokio::task::spawn_blocking(move || controller.stop()).await;
            match result {
                Ok(Ok(())) => debug!(pod_id = %pod_id, container = %name, "Container stopped"),
                Ok(Err(e)) => {
                    warn!(pod_id = %pod_id, container = %name, error = %e, "Error stopping container")
                }
                Err(e) => {
                    warn!(pod_id = %pod_id, container = %name, error = %e, "Stop task failed")
                }
            }
        }

        self.publish(PodEvent::deleted(pod_id)).await;

        {
            let mut pods = self.pods.write().await;
            if pods.get(pod_id).is_some_and(|e| Arc::ptr_eq(e, &entry)) {
                pods.remove(pod_id);
            }
        }

        info!(pod_id = %pod_id, "Pod deleted");
        true
    }

    /// Re-read every started container's pid and record its liveness.
    ///
    /// Pods whose recorded liveness changed are republished.
    pub async fn check_liveness(&self) {
        let entries: Vec<(String, Arc<Mutex<PodEntry>>)> = {
            let pods = self.pods.read().await;
            pods.iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };

        for (pod_id, entry) in entries {
            // A pod mid-reconcile or mid-delete is checked on a later tick.
            let Ok(mut entry) = entry.try_lock() else {
                debug!(pod_id = %pod_id, "Pod busy, skipping liveness check");
                continue;
            };
            if entry.deleted {
                continue;
            }

            let mut changed = false;
            let probes: Vec<(String, Arc<dyn ProcessController>)> = entry
                .processes
                .iter()
                .map(|(name, c)| (name.clone(), Arc::clone(c)))
                .collect();

            for (name, controller) in probes {
                let pid = match controller.pid() {
                    Ok(pid) => pid.filter(|p| *p > 0),
                    Err(e) => {
                        warn!(pod_id = %pod_id, container = %name, error = %e, "Error probing container");
                        None
                    }
                };

                let was_alive = entry
                    .pod
                    .current_state
                    .as_ref()
                    .and_then(|c| c.info.as_ref())
                    .and_then(|info| info.get(&name))
                    .and_then(|i| i.state.as_ref())
                    .is_some_and(|s| s.running.is_some());

                if was_alive != pid.is_some() {
                    warn!(
                        pod_id = %pod_id,
                        container = %name,
                        alive = pid.is_some(),
                        "Container liveness changed"
                    );
                    if let Err(e) = record_liveness(&mut entry.pod, &name, pid) {
                        warn!(pod_id = %pod_id, error = %e, "Failed to record liveness");
                        continue;
                    }
                    changed = true;
                }
            }

            if changed {
                self.publish(PodEvent::upserted(entry.pod.clone())).await;
            }
        }
    }
}

/// Fold a repeated declaration into the stored pod.
fn merge_declaration(stored: &mut Pod, update: Pod) -> Result<(), StateError> {
    stored.labels = update.labels;

    let containers = update
        .desired_state
        .and_then(|d| d.manifest)
        .map(|m| m.containers)
        .unwrap_or_default();
    if !containers.is_empty() {
        let manifest = state::ensure_manifest(stored)?;
        for container in containers {
            manifest.upsert_container(container);
        }
    }

    if let Some(current) = update.current_state {
        if current.host.is_some() || current.pod_ip.is_some() {
            let stored_current = state::ensure_current_state(stored)?;
            if current.host.is_some() {
                stored_current.host = current.host;
            }
            if current.pod_ip.is_some() {
                stored_current.pod_ip = current.pod_ip;
            }
        }
    }
    Ok(())
}

fn record_liveness(pod: &mut Pod, container: &str, pid: Option<u32>) -> Result<(), StateError> {
    state::set_container_alive(pod, container, pid.is_some())?;
    state::ensure_container_info(pod, container)?.pid = pid;
    Ok(())
}
