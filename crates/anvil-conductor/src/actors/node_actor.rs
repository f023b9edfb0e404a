//! Node actor
//!
//! One actor per managed node. The actor serializes intra-process requests
//! for its node through the kameo mailbox; cross-conductor exclusion is the
//! reservation's job, which the orchestrator enforces underneath on every
//! operation.

use crate::orchestrator::NodeOrchestrator;
use anvil_core::{Fault, Health, Node, PowerState, ProvisionState};
use kameo::{
    message::{Context, Message},
    Actor, Reply,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Actor managing a single node.
#[derive(Actor)]
pub struct NodeActor {
    pub node_id: Uuid,
    orchestrator: Arc<NodeOrchestrator>,
}

impl NodeActor {
    pub fn new(node_id: Uuid, orchestrator: Arc<NodeOrchestrator>) -> Self {
        Self {
            node_id,
            orchestrator,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Drive the node to a power state.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChangePowerState {
    pub target: PowerState,
    pub user: Option<String>,
}

impl Message<ChangePowerState> for NodeActor {
    type Reply = Result<(), String>;

    async fn handle(
        &mut self,
        msg: ChangePowerState,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(node_id = %self.node_id, target = %msg.target, "handling power state request");
        self.orchestrator
            .change_power_state(self.node_id, msg.target, msg.user)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Drive the node to a provisioning state.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChangeProvisionState {
    pub target: ProvisionState,
    pub user: Option<String>,
}

impl Message<ChangeProvisionState> for NodeActor {
    type Reply = Result<(), String>;

    async fn handle(
        &mut self,
        msg: ChangeProvisionState,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        debug!(node_id = %self.node_id, target = %msg.target, "handling provision state request");
        self.orchestrator
            .change_provision_state(self.node_id, msg.target, msg.user)
            .await
            .map_err(|e| e.to_string())
    }
}

/// Reconcile the recorded power state with the hardware.
#[derive(Clone, Serialize, Deserialize)]
pub struct SyncPowerState;

impl Message<SyncPowerState> for NodeActor {
    type Reply = Result<(), String>;

    async fn handle(
        &mut self,
        _msg: SyncPowerState,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        self.orchestrator
            .sync_power_state(self.node_id)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Get node status.
#[derive(Clone, Serialize, Deserialize)]
pub struct GetNodeStatus;

#[derive(Clone, Serialize, Deserialize, Reply)]
pub struct NodeStatus {
    pub node_id: Uuid,
    pub name: Option<String>,
    pub power_state: PowerState,
    pub target_power_state: Option<PowerState>,
    pub provision_state: ProvisionState,
    pub target_provision_state: Option<ProvisionState>,
    pub maintenance: bool,
    pub fault: Option<Fault>,
    pub health: Health,
    pub last_error: Option<String>,
    pub conductor_affinity: Option<String>,
}

impl From<&Node> for NodeStatus {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.uuid,
            name: node.name.clone(),
            power_state: node.power_state,
            target_power_state: node.target_power_state,
            provision_state: node.provision_state,
            target_provision_state: node.target_provision_state,
            maintenance: node.maintenance,
            fault: node.fault,
            health: node.health,
            last_error: node.last_error.clone(),
            conductor_affinity: node.conductor_affinity.clone(),
        }
    }
}

impl Message<GetNodeStatus> for NodeActor {
    type Reply = Result<NodeStatus, String>;

    async fn handle(
        &mut self,
        _msg: GetNodeStatus,
        _ctx: Context<'_, Self, Self::Reply>,
    ) -> Self::Reply {
        let node = self
            .orchestrator
            .node(self.node_id)
            .await
            .map_err(|e| e.to_string())?;
        Ok(NodeStatus::from(&node))
    }
}
