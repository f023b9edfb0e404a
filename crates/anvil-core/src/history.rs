//! Node history entries
//!
//! Immutable audit records of state transitions and operator actions.
//! Entries reference nodes by id without owning them; a node may be deleted
//! while its history remains. Retention is an external concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Category of a history entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    Power,
    Provisioning,
    Maintenance,
    Reservation,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One append-only audit record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub uuid: Uuid,
    /// Reference, not ownership.
    pub node_id: Uuid,
    /// Conductor that performed or observed the event.
    pub conductor: String,
    pub event_type: EventType,
    pub severity: Severity,
    /// Free-text description.
    pub event: String,
    /// Requesting user, when the event was operator-initiated.
    pub user: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        node_id: Uuid,
        conductor: &str,
        event_type: EventType,
        severity: Severity,
        event: String,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            node_id,
            conductor: conductor.to_string(),
            event_type,
            severity,
            event,
            user: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }
}
