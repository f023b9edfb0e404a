//! NodeActorManager
//!
//! Keeps one [`NodeActor`] alive per node in this conductor's group and
//! drives the periodic background work: liveness heartbeats and the power
//! resync sweep. Nodes entering or leaving the group get their actors
//! spawned and stopped on the next sync.

use super::node_actor::{GetNodeStatus, NodeActor, NodeStatus};
use crate::config::ConductorConfig;
use crate::observability::metrics;
use crate::orchestrator::NodeOrchestrator;
use crate::store::NodeStore;
use kameo::actor::ActorRef;
use kameo::request::MessageSend;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct NodeActorManager {
    config: Arc<ConductorConfig>,
    store: Arc<dyn NodeStore>,
    orchestrator: Arc<NodeOrchestrator>,
    /// Active node actors keyed by node id.
    actors: HashMap<Uuid, ActorRef<NodeActor>>,
}

impl NodeActorManager {
    pub fn new(
        config: Arc<ConductorConfig>,
        store: Arc<dyn NodeStore>,
        orchestrator: Arc<NodeOrchestrator>,
    ) -> Self {
        Self {
            config,
            store,
            orchestrator,
            actors: HashMap::new(),
        }
    }

    /// Start the manager - runs the heartbeat and resync loops.
    pub async fn run(mut self) -> Result<(), anyhow::Error> {
        info!(
            conductor_id = %self.config.conductor_id,
            conductor_group = %self.config.conductor_group,
            "starting node actor manager"
        );

        self.sync_actors().await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut resync = tokio::time::interval_at(
            Instant::now() + self.config.resync_initial_delay,
            self.config.resync_interval,
        );

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.heartbeat(&self.config.conductor_id).await {
                        warn!(error = %e, "liveness heartbeat failed");
                    }
                }
                _ = resync.tick() => {
                    self.sync_actors().await;
                    let synced = self.orchestrator.resync_sweep().await;
                    debug!(nodes_synced = synced, "resync sweep complete");
                }
            }
        }
    }

    /// Reconcile the actor set against the store: spawn for new group
    /// members, stop for nodes deleted or moved to another group.
    pub async fn sync_actors(&mut self) {
        let nodes = match self.store.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "actor sync could not list nodes");
                return;
            }
        };

        let mut wanted: HashSet<Uuid> = HashSet::new();
        for node in &nodes {
            if node.conductor_group != self.config.conductor_group {
                continue;
            }
            wanted.insert(node.uuid);
            if !self.actors.contains_key(&node.uuid) {
                let actor = NodeActor::new(node.uuid, Arc::clone(&self.orchestrator));
                let actor_ref = kameo::spawn(actor);
                info!(node_id = %node.uuid, "spawned node actor");
                self.actors.insert(node.uuid, actor_ref);
            }
        }

        let stale: Vec<Uuid> = self
            .actors
            .keys()
            .filter(|id| !wanted.contains(id))
            .copied()
            .collect();
        for node_id in stale {
            if let Some(actor_ref) = self.actors.remove(&node_id) {
                info!(node_id = %node_id, "stopping node actor");
                actor_ref.stop_gracefully().await.ok();
            }
        }

        metrics::set_node_actor_count(self.actors.len());
    }

    pub fn actor_for(&self, node_id: Uuid) -> Option<ActorRef<NodeActor>> {
        self.actors.get(&node_id).cloned()
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Status of every locally-managed node, queried concurrently.
    pub async fn get_all_statuses(&self) -> Vec<NodeStatus> {
        let asks = self.actors.iter().map(|(node_id, actor_ref)| async move {
            match actor_ref.ask(GetNodeStatus).send().await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "failed to get status from actor");
                    None
                }
            }
        });
        futures::future::join_all(asks)
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Spawn the NodeActorManager as a background task.
pub fn spawn_node_actor_manager(
    config: Arc<ConductorConfig>,
    store: Arc<dyn NodeStore>,
    orchestrator: Arc<NodeOrchestrator>,
) -> tokio::task::JoinHandle<()> {
    let manager = NodeActorManager::new(config, store, orchestrator);
    tokio::spawn(async move {
        if let Err(e) = manager.run().await {
            error!(error = %e, "node actor manager failed");
        }
    })
}
