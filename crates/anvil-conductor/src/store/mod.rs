//! Shared node storage
//!
//! The node record is the only shared mutable resource in the engine, and
//! this trait is the seam it is shared through. The reservation operations
//! are conditional compare-and-set primitives: holders run in independent
//! processes, so mutual exclusion lives in the storage layer, not in any
//! in-process mutex. History appends are append-only inserts, ordered per
//! node.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use anvil_core::{AnvilError, HistoryEntry, Node};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    NodeNotFound(Uuid),

    /// Reservation compare-and-set lost: the node is held by `holder`.
    #[error("node {node} is reserved by {holder}")]
    ReservationHeld { node: Uuid, holder: String },

    /// A guarded write or release found the caller is not the holder.
    #[error("conductor {conductor} does not hold the reservation on node {node}")]
    NotHolder { node: Uuid, conductor: String },

    #[error("a node named {0} already exists")]
    DuplicateName(String),

    #[error("node {node} is busy: {reason}")]
    NodeBusy { node: Uuid, reason: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for AnvilError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NodeNotFound(id) => AnvilError::NodeNotFound(id),
            StoreError::ReservationHeld { node, holder } => {
                AnvilError::AlreadyReserved { node, holder }
            }
            StoreError::NotHolder { node, conductor } => {
                AnvilError::NotHolder { node, conductor }
            }
            StoreError::DuplicateName(name) => AnvilError::DuplicateName(name),
            StoreError::NodeBusy { node, reason } => AnvilError::NodeBusy { node, reason },
            StoreError::Backend(msg) => AnvilError::Storage(msg),
        }
    }
}

/// Storage collaborator providing atomic conditional updates on node
/// records and append-only history inserts.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Enroll a node. Fails on duplicate uuid or name.
    async fn create_node(&self, node: Node) -> Result<(), StoreError>;

    async fn get_node(&self, id: Uuid) -> Result<Node, StoreError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Node>, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Decommission. Refused while the node is reserved or an operation is
    /// in flight.
    async fn delete_node(&self, id: Uuid) -> Result<(), StoreError>;

    /// Compare-and-set `reservation`: succeeds iff it was null or already
    /// held by `conductor` (re-acquire is idempotent). Returns the node as
    /// reserved.
    async fn try_reserve(&self, id: Uuid, conductor: &str) -> Result<Node, StoreError>;

    /// Compare-and-set `reservation` from `from` to `to`, for takeover of a
    /// dead conductor's nodes.
    async fn steal_reservation(&self, id: Uuid, from: &str, to: &str)
        -> Result<Node, StoreError>;

    /// Clear `reservation` iff held by `conductor`.
    async fn release(&self, id: Uuid, conductor: &str) -> Result<(), StoreError>;

    /// Write `node` iff the stored record is still reserved by `conductor`.
    /// This is the precondition re-check before every mutating step.
    async fn save_guarded(&self, node: &Node, conductor: &str) -> Result<(), StoreError>;

    /// Register this conductor as alive in shared storage.
    async fn register_conductor(&self, id: &str) -> Result<(), StoreError>;

    /// Refresh this conductor's liveness marker.
    async fn heartbeat(&self, id: &str) -> Result<(), StoreError>;

    /// Whether `id` is currently considered alive. Drives reservation
    /// takeover.
    async fn conductor_alive(&self, id: &str) -> Result<bool, StoreError>;

    /// Append one history entry. Append-only; never mutated or deleted.
    async fn append_history(&self, entry: HistoryEntry) -> Result<(), StoreError>;

    /// History for one node in creation order, optionally bounded to the
    /// half-open window `[since, until)`.
    async fn list_history(
        &self,
        node_id: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<HistoryEntry>, StoreError>;
}
