//! Per-node actors and their manager.

pub mod manager;
pub mod node_actor;

pub use manager::{spawn_node_actor_manager, NodeActorManager};
pub use node_actor::{
    ChangePowerState, ChangeProvisionState, GetNodeStatus, NodeActor, NodeStatus, SyncPowerState,
};
