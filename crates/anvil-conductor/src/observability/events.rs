//! Structured Events
//!
//! Structured event logging with consistent fields across the conductor.
//! Each event type has a dedicated function so field naming stays uniform.
//!
//! Event types:
//! - `power_state_changed` - Confirmed power transitions
//! - `provision_state_changed` - Confirmed provisioning transitions
//! - `reservation_stolen` - Takeover of a dead conductor's reservation
//! - `retries_exhausted` - An action spent its whole retry budget
//! - `node_faulted` - A fault code was recorded on a node
//! - `audit_write_failed` - History append failed after a successful action
//! - `conductor_registered` - This conductor joined the fleet

use anvil_core::{Fault, PowerState, ProvisionState};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Emit a confirmed power state change.
pub fn power_state_changed(node_id: Uuid, previous: PowerState, new: PowerState) {
    info!(
        event_type = "power_state_changed",
        node_id = %node_id,
        previous_state = %previous,
        new_state = %new,
        "Power state changed"
    );
}

/// Emit a confirmed provisioning state change.
pub fn provision_state_changed(node_id: Uuid, previous: ProvisionState, new: ProvisionState) {
    info!(
        event_type = "provision_state_changed",
        node_id = %node_id,
        previous_state = %previous,
        new_state = %new,
        "Provision state changed"
    );
}

/// Emit a reservation takeover event.
pub fn reservation_stolen(node_id: Uuid, dead_holder: &str, new_holder: &str) {
    warn!(
        event_type = "reservation_stolen",
        node_id = %node_id,
        dead_holder = %dead_holder,
        new_holder = %new_holder,
        "Reservation taken over from dead conductor"
    );
}

/// Emit a retry budget exhaustion event.
pub fn retries_exhausted(node_id: Uuid, action: &str, attempts: u32, last_error: &str) {
    warn!(
        event_type = "retries_exhausted",
        node_id = %node_id,
        action = %action,
        attempts = attempts,
        last_error = %last_error,
        "Retries exhausted"
    );
}

/// Emit a node fault event.
pub fn node_faulted(node_id: Uuid, fault: Fault, error: &str) {
    error!(
        event_type = "node_faulted",
        node_id = %node_id,
        fault = %fault,
        error = %error,
        "Node faulted"
    );
}

/// Emit an audit write failure. The operation that produced the entry has
/// already been durably applied; this failure is surfaced on its own.
pub fn audit_write_failed(node_id: Uuid, error: &str) {
    error!(
        event_type = "audit_write_failed",
        node_id = %node_id,
        error = %error,
        "History append failed; node state was already applied"
    );
}

/// Emit a conductor registration event.
pub fn conductor_registered(conductor_id: &str, conductor_group: &str) {
    info!(
        event_type = "conductor_registered",
        conductor_id = %conductor_id,
        conductor_group = %conductor_group,
        "Conductor registered"
    );
}
