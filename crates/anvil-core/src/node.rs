//! Node record
//!
//! The central entity: one physical machine, its driver selection, live
//! power/provisioning state, and the reservation column that serializes
//! conflicting operators across the fleet.

use crate::interfaces::InterfaceKind;
use crate::states::{Fault, Health, PowerState, ProvisionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Resolved implementation name per capability kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InterfaceSelection {
    pub power: String,
    pub management: String,
    pub boot: String,
    pub deploy: String,
    pub raid: String,
    pub bios: String,
    pub firmware: String,
    pub inspect: String,
    pub rescue: String,
    pub console: String,
    pub vendor: String,
}

impl InterfaceSelection {
    /// All kinds selecting implementations of one hardware type prefix,
    /// e.g. `uniform("fake")` selects `fake-power`, `fake-deploy`, ...
    pub fn uniform(prefix: &str) -> Self {
        Self {
            power: format!("{prefix}-power"),
            management: format!("{prefix}-management"),
            boot: format!("{prefix}-boot"),
            deploy: format!("{prefix}-deploy"),
            raid: format!("{prefix}-raid"),
            bios: format!("{prefix}-bios"),
            firmware: format!("{prefix}-firmware"),
            inspect: format!("{prefix}-inspect"),
            rescue: format!("{prefix}-rescue"),
            console: format!("{prefix}-console"),
            vendor: format!("{prefix}-vendor"),
        }
    }

    pub fn get(&self, kind: InterfaceKind) -> &str {
        match kind {
            InterfaceKind::Power => &self.power,
            InterfaceKind::Management => &self.management,
            InterfaceKind::Boot => &self.boot,
            InterfaceKind::Deploy => &self.deploy,
            InterfaceKind::Raid => &self.raid,
            InterfaceKind::Bios => &self.bios,
            InterfaceKind::Firmware => &self.firmware,
            InterfaceKind::Inspect => &self.inspect,
            InterfaceKind::Rescue => &self.rescue,
            InterfaceKind::Console => &self.console,
            InterfaceKind::Vendor => &self.vendor,
        }
    }
}

/// A managed physical machine.
///
/// Live state fields and `driver_internal_info` are mutated only by the
/// conductor currently holding `reservation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Immutable identity.
    pub uuid: Uuid,
    /// Optional human-friendly name, unique across the fleet.
    pub name: Option<String>,

    /// Hardware type key into the driver registry.
    pub driver: String,
    /// Per-capability implementation selection.
    pub interfaces: InterfaceSelection,

    pub power_state: PowerState,
    /// Non-null only while a power operation is outstanding.
    pub target_power_state: Option<PowerState>,
    pub provision_state: ProvisionState,
    /// Non-null only while a provisioning operation is outstanding.
    pub target_provision_state: Option<ProvisionState>,

    /// Conductor currently holding the exclusive lock, if any.
    pub reservation: Option<String>,
    /// Last conductor that successfully acted on this node.
    pub conductor_affinity: Option<String>,

    pub maintenance: bool,
    pub maintenance_reason: Option<String>,
    pub fault: Option<Fault>,
    pub last_error: Option<String>,
    pub health: Health,
    /// When set, power-off targets are rejected; reboot stays allowed.
    pub disable_power_off: bool,

    pub conductor_group: String,
    pub shard: Option<String>,
    /// Chassis-member nodes point at their enclosing node.
    pub parent_node: Option<Uuid>,

    /// Backend connection parameters (BMC address, credentials reference...).
    pub driver_info: BTreeMap<String, serde_json::Value>,
    /// Backend-owned transient bookkeeping (retry counters and the like).
    pub driver_internal_info: BTreeMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Enroll a new node under `driver`, interfaces defaulting to the
    /// driver's uniform naming. Starts unreserved, power unknown, in
    /// `enroll`.
    pub fn new(driver: &str) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            name: None,
            driver: driver.to_string(),
            interfaces: InterfaceSelection::uniform(driver),
            power_state: PowerState::Unknown,
            target_power_state: None,
            provision_state: ProvisionState::Enroll,
            target_provision_state: None,
            reservation: None,
            conductor_affinity: None,
            maintenance: false,
            maintenance_reason: None,
            fault: None,
            last_error: None,
            health: Health::Ok,
            disable_power_off: false,
            conductor_group: "default".to_string(),
            shard: None,
            parent_node: None,
            driver_info: BTreeMap::new(),
            driver_internal_info: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Whether any power or provisioning operation is outstanding.
    pub fn operation_in_flight(&self) -> bool {
        self.target_power_state.is_some() || self.target_provision_state.is_some()
    }

    /// Clear `fault` if it matches `kind`; the rule is that a fault is only
    /// cleared by a subsequent success of the action kind that set it.
    pub fn clear_fault_if(&mut self, kind: Fault) {
        if self.fault == Some(kind) {
            self.fault = None;
            if self.health == Health::Critical {
                self.health = Health::Ok;
            }
        }
    }

    /// Record a terminal operation failure.
    pub fn record_fault(&mut self, kind: Fault, error: String) {
        self.fault = Some(kind);
        self.last_error = Some(error);
        self.health = Health::Critical;
    }
}
