//! Service membership tracking.
//!
//! Pod events are fanned out to shard workers by pod id. Each worker owns a
//! mailbox and applies its events strictly in arrival order, so all events
//! for one pod id have a single writer and cannot overtake each other.
//! Distinct pod ids on different shards proceed concurrently.
//!
//! Each worker also remembers the latest document of every pod it has seen.
//! A newly registered service is seeded from that memory through the same
//! mailbox, which keeps the seed ordered with the shard's live events.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arc_swap::ArcSwap;
use podlet_model::{Pod, PodEvent, Service};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::balancer::BalancerError;
use super::service::{ConfigurationError, ServiceInstance};
use super::BackendEndpoint;

/// Default number of shard workers.
pub const DEFAULT_SHARDS: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{service_id}' has no available backends")]
    NoAvailableBackends { service_id: String },

    #[error("membership tracker stopped")]
    TrackerStopped,
}

type ServiceMap = HashMap<String, Arc<ServiceInstance>>;

enum ShardCommand {
    Event(PodEvent),
    /// Replay every known pod into a new service, then ack.
    Seed(Arc<ServiceInstance>, oneshot::Sender<()>),
    /// Ack once everything queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

/// Routes pod lifecycle events to every registered service.
pub struct MembershipTracker {
    services: Arc<ArcSwap<ServiceMap>>,
    shards: Vec<mpsc::UnboundedSender<ShardCommand>>,
}

impl MembershipTracker {
    /// Start `shards` workers on the current runtime.
    pub fn spawn(shards: usize) -> Self {
        let services: Arc<ArcSwap<ServiceMap>> = Arc::new(ArcSwap::from_pointee(HashMap::new()));

        let shards = (0..shards.max(1))
            .map(|index| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_shard(index, rx, Arc::clone(&services)));
                tx
            })
            .collect::<Vec<_>>();

        info!(shards = shards.len(), "Membership tracker started");
        Self { services, shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, pod_id: &str) -> &mpsc::UnboundedSender<ShardCommand> {
        let mut hasher = DefaultHasher::new();
        pod_id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Queue a pod event on its shard.
    pub fn dispatch(&self, event: PodEvent) -> Result<(), RouteError> {
        self.shard_for(event.pod_id())
            .send(ShardCommand::Event(event))
            .map_err(|_| RouteError::TrackerStopped)
    }

    /// Consume a pod event feed until it closes.
    pub async fn run(&self, mut events: mpsc::Receiver<PodEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.dispatch(event) {
                warn!(error = %e, "Dropping pod event");
                break;
            }
        }
        debug!("Pod event feed closed");
    }

    /// Register (or replace) a service and seed it with the pods seen so far.
    pub async fn register_service(
        &self,
        service: Service,
    ) -> Result<Arc<ServiceInstance>, RouteError> {
        let instance = Arc::new(ServiceInstance::new(service)?);
        let id = instance.id().to_string();

        let previous = self.services.rcu(|current| {
            let mut next = ServiceMap::clone(current);
            next.insert(id.clone(), Arc::clone(&instance));
            next
        });
        if previous.contains_key(&id) {
            info!(service_id = %id, "Service replaced");
        }

        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .send(ShardCommand::Seed(Arc::clone(&instance), tx))
                .map_err(|_| RouteError::TrackerStopped)?;
            acks.push(rx);
        }
        for ack in acks {
            ack.await.map_err(|_| RouteError::TrackerStopped)?;
        }

        info!(
            service_id = %id,
            port = instance.port(),
            container_port = instance.container_port(),
            backends = instance.backend_count(),
            "Service registered"
        );
        Ok(instance)
    }

    pub fn remove_service(&self, service_id: &str) -> bool {
        let previous = self.services.rcu(|current| {
            let mut next = ServiceMap::clone(current);
            next.remove(service_id);
            next
        });
        let removed = previous.contains_key(service_id);
        if removed {
            info!(service_id = %service_id, "Service removed");
        }
        removed
    }

    pub fn service(&self, service_id: &str) -> Option<Arc<ServiceInstance>> {
        self.services.load().get(service_id).cloned()
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services.load().keys().cloned().collect()
    }

    /// Pick a backend for a service.
    pub fn select_backend(&self, service_id: &str) -> Result<BackendEndpoint, RouteError> {
        let instance = self
            .service(service_id)
            .ok_or_else(|| RouteError::UnknownService(service_id.to_string()))?;

        instance.select_backend().map_err(|e| match e {
            BalancerError::NoAvailableBackends => RouteError::NoAvailableBackends {
                service_id: service_id.to_string(),
            },
        })
    }

    /// Wait until every event dispatched so far has been applied.
    pub async fn flush(&self) -> Result<(), RouteError> {
        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard
                .send(ShardCommand::Flush(tx))
                .map_err(|_| RouteError::TrackerStopped)?;
            acks.push(rx);
        }
        for ack in acks {
            ack.await.map_err(|_| RouteError::TrackerStopped)?;
        }
        Ok(())
    }
}

async fn run_shard(
    index: usize,
    mut rx: mpsc::UnboundedReceiver<ShardCommand>,
    services: Arc<ArcSwap<ServiceMap>>,
) {
    let mut known: HashMap<String, Pod> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            ShardCommand::Event(event) => {
                for instance in services.load().values() {
                    instance.apply(&event);
                }
                match event {
                    PodEvent::Upserted { id, pod } => {
                        known.insert(id, pod);
                    }
                    PodEvent::Deleted { id } => {
                        known.remove(&id);
                    }
                }
            }
            ShardCommand::Seed(instance, done) => {
                for (id, pod) in &known {
                    instance.entity_changed(id, pod);
                }
                let _ = done.send(());
            }
            ShardCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!(shard = index, "Membership shard stopped");
}
