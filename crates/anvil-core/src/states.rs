//! Power and provisioning state model
//!
//! States are plain enumerated values; which provisioning transitions are
//! legal is data held in a [`TransitionTable`], not logic baked into the
//! engine. Deployments with driver-specific lifecycles extend the default
//! table at startup instead of patching code.

use crate::interfaces::InterfaceKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

/// Power state of a node as last confirmed by its power interface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Rebooting,
    Unknown,
}

impl PowerState {
    /// Whether this state may be requested as a target.
    ///
    /// `Unknown` is an observation, never a goal.
    pub fn is_valid_target(self) -> bool {
        !matches!(self, PowerState::Unknown)
    }

    /// The state a node settles into once this target is achieved.
    /// A completed reboot leaves the node powered on.
    pub fn settled(self) -> PowerState {
        match self {
            PowerState::Rebooting => PowerState::On,
            other => other,
        }
    }
}

/// Provisioning state of a node.
///
/// The engine treats these as opaque values validated against a
/// [`TransitionTable`]; the failed states exist so drivers and operators can
/// model them even though the engine itself never moves a node into a state
/// the hardware did not confirm.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProvisionState {
    Enroll,
    Manageable,
    Available,
    Deploying,
    Active,
    DeployFailed,
    Cleaning,
    CleanFailed,
    Rescuing,
    Rescue,
    RescueFailed,
    Deleting,
    Error,
}

/// The hardware action a legal provisioning transition maps onto.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProvisionVerb {
    /// Validate out-of-band access (enroll -> manageable).
    Manage,
    /// Prepare a manageable node for scheduling (manageable -> available).
    Provide,
    /// Write an image and boot into it.
    Deploy,
    /// Undeploy and return the node to the pool.
    TearDown,
    /// Run cleaning steps.
    Clean,
    /// Boot the rescue ramdisk.
    Rescue,
    /// Leave rescue mode and boot the deployed instance.
    Unrescue,
}

impl ProvisionVerb {
    /// Capability kind that carries out this verb.
    pub fn interface_kind(self) -> InterfaceKind {
        match self {
            // Managing a node is a credential/connectivity check against its
            // out-of-band power channel.
            ProvisionVerb::Manage => InterfaceKind::Power,
            ProvisionVerb::Provide | ProvisionVerb::Deploy | ProvisionVerb::TearDown => {
                InterfaceKind::Deploy
            }
            ProvisionVerb::Clean => InterfaceKind::Deploy,
            ProvisionVerb::Rescue | ProvisionVerb::Unrescue => InterfaceKind::Rescue,
        }
    }

    /// Fault code recorded when this verb ultimately fails.
    pub fn fault(self) -> Fault {
        match self {
            ProvisionVerb::Manage => Fault::PowerFailure,
            ProvisionVerb::Provide | ProvisionVerb::Deploy | ProvisionVerb::TearDown => {
                Fault::DeployFailure
            }
            ProvisionVerb::Clean => Fault::CleanFailure,
            ProvisionVerb::Rescue | ProvisionVerb::Unrescue => Fault::RescueFailure,
        }
    }
}

/// Sticky fault classification on a node.
///
/// Cleared only by a later successful action of the same kind that set it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Fault {
    PowerFailure,
    DeployFailure,
    CleanFailure,
    RescueFailure,
}

/// Coarse node health derived from recent operation outcomes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Health {
    #[default]
    Ok,
    Warning,
    Critical,
}

/// Legal provisioning transitions, keyed by (from, requested target).
///
/// Constructed with a default edge set covering the standard lifecycle and
/// extensible per deployment via [`TransitionTable::allow`].
#[derive(Debug, Clone)]
pub struct TransitionTable {
    edges: HashMap<(ProvisionState, ProvisionState), ProvisionVerb>,
}

impl TransitionTable {
    /// An empty table. Every request is rejected until edges are added.
    pub fn empty() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    /// Permit `from -> to`, carried out by `verb`.
    pub fn allow(&mut self, from: ProvisionState, to: ProvisionState, verb: ProvisionVerb) {
        self.edges.insert((from, to), verb);
    }

    /// Remove a transition (deployments that forbid e.g. rescue).
    pub fn disallow(&mut self, from: ProvisionState, to: ProvisionState) {
        self.edges.remove(&(from, to));
    }

    pub fn is_allowed(&self, from: ProvisionState, to: ProvisionState) -> bool {
        self.edges.contains_key(&(from, to))
    }

    /// The verb carrying out `from -> to`, if the transition is legal.
    pub fn verb_for(&self, from: ProvisionState, to: ProvisionState) -> Option<ProvisionVerb> {
        self.edges.get(&(from, to)).copied()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        use ProvisionState::*;
        use ProvisionVerb as V;

        let mut t = Self::empty();
        t.allow(Enroll, Manageable, V::Manage);
        t.allow(Manageable, Available, V::Provide);
        t.allow(Manageable, Cleaning, V::Clean);
        t.allow(Cleaning, Available, V::Clean);
        t.allow(CleanFailed, Available, V::Provide);
        t.allow(CleanFailed, Manageable, V::Manage);
        t.allow(Available, Active, V::Deploy);
        t.allow(Available, Manageable, V::Manage);
        t.allow(DeployFailed, Active, V::Deploy);
        t.allow(DeployFailed, Available, V::TearDown);
        t.allow(Active, Available, V::TearDown);
        t.allow(Active, Rescue, V::Rescue);
        t.allow(Rescue, Active, V::Unrescue);
        t.allow(Rescue, Available, V::TearDown);
        t.allow(RescueFailed, Rescue, V::Rescue);
        t.allow(RescueFailed, Available, V::TearDown);
        t.allow(Error, Active, V::Deploy);
        t.allow(Error, Available, V::TearDown);
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn power_state_round_trips_through_strings() {
        assert_eq!(PowerState::On.to_string(), "on");
        assert_eq!(PowerState::from_str("off").unwrap(), PowerState::Off);
        assert_eq!(
            ProvisionState::from_str("deploy_failed").unwrap(),
            ProvisionState::DeployFailed
        );
    }

    #[test]
    fn unknown_is_never_a_target() {
        assert!(!PowerState::Unknown.is_valid_target());
        assert!(PowerState::Rebooting.is_valid_target());
    }

    #[test]
    fn reboot_settles_to_on() {
        assert_eq!(PowerState::Rebooting.settled(), PowerState::On);
        assert_eq!(PowerState::Off.settled(), PowerState::Off);
    }

    #[test]
    fn default_table_covers_the_standard_lifecycle() {
        let t = TransitionTable::default();
        assert_eq!(
            t.verb_for(ProvisionState::Available, ProvisionState::Active),
            Some(ProvisionVerb::Deploy)
        );
        assert_eq!(
            t.verb_for(ProvisionState::Active, ProvisionState::Available),
            Some(ProvisionVerb::TearDown)
        );
        // No shortcut from enroll straight to a running instance.
        assert!(!t.is_allowed(ProvisionState::Enroll, ProvisionState::Active));
    }

    #[test]
    fn table_is_data_not_code() {
        let mut t = TransitionTable::default();
        t.disallow(ProvisionState::Active, ProvisionState::Rescue);
        assert!(!t.is_allowed(ProvisionState::Active, ProvisionState::Rescue));

        t.allow(
            ProvisionState::Enroll,
            ProvisionState::Available,
            ProvisionVerb::Provide,
        );
        assert!(t.is_allowed(ProvisionState::Enroll, ProvisionState::Available));
    }
}
