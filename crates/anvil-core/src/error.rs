//! Error taxonomy for node orchestration
//!
//! Every variant maps to one class of the recovery policy: configuration
//! errors fail fast, reservation conflicts are non-fatal signals the caller
//! may retry later, hardware failures end one node operation but never the
//! process, and storage failures are kept distinct from operation outcomes.

use crate::interfaces::{HardwareError, InterfaceKind};
use crate::states::{PowerState, ProvisionState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AnvilError {
    /// No active implementation for this namespace/driver combination.
    /// A configuration error: surfaced synchronously, never retried.
    #[error("no {kind} interface available for driver {driver}: {reason}")]
    InterfaceNotAvailable {
        kind: InterfaceKind,
        driver: String,
        reason: String,
    },

    #[error("unknown driver {0}")]
    UnknownDriver(String),

    /// Another conductor holds the node. Non-fatal; poll and retry.
    #[error("node {node} is reserved by {holder}")]
    AlreadyReserved { node: Uuid, holder: String },

    /// Release attempted by a conductor that is not the holder. Explicit by
    /// design: a silent success here would mask two conductors believing
    /// they both hold the node.
    #[error("conductor {conductor} does not hold the reservation on node {node}")]
    NotHolder { node: Uuid, conductor: String },

    /// The reservation was revoked mid-operation (holder presumed dead and
    /// taken over). Distinct from any hardware failure: the in-flight
    /// operation aborted without applying further state.
    #[error("reservation on node {node} was lost mid-operation")]
    LostReservation { node: Uuid },

    #[error("provision transition {from} -> {to} is not allowed on node {node}")]
    InvalidTransition {
        node: Uuid,
        from: ProvisionState,
        to: ProvisionState,
    },

    #[error("power state {target} is not a valid target for node {node}")]
    InvalidPowerTarget { node: Uuid, target: PowerState },

    #[error("power off is disabled on node {node}")]
    PowerOffDisabled { node: Uuid },

    #[error("node {0} not found")]
    NodeNotFound(Uuid),

    #[error("a node named {0} already exists")]
    DuplicateName(String),

    /// Decommission refused while reserved or mid-operation.
    #[error("node {node} is busy: {reason}")]
    NodeBusy { node: Uuid, reason: String },

    /// The action executor spent its whole budget. Carries the attempt count
    /// and the last underlying failure so exhaustion is distinguishable from
    /// a single-attempt failure.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: HardwareError },

    /// Fatal hardware failure, aborted without retrying.
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage backend failure. Never conflated with an operation outcome.
    #[error("storage error: {0}")]
    Storage(String),
}

impl AnvilError {
    /// Reservation-class conditions a caller may retry after backoff.
    pub fn is_reservation_conflict(&self) -> bool {
        matches!(
            self,
            AnvilError::AlreadyReserved { .. }
                | AnvilError::NotHolder { .. }
                | AnvilError::LostReservation { .. }
        )
    }
}
