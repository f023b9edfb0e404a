//! Core shared types for anvil
//!
//! This crate contains the data model, hardware capability contract, and
//! error taxonomy shared across the anvil bare-metal orchestration system.

pub mod error;
pub mod history;
pub mod interfaces;
pub mod node;
pub mod states;

pub use error::AnvilError;
pub use history::{EventType, HistoryEntry, Severity};
pub use interfaces::{BootDevice, Extension, HardwareError, InterfaceImpl, InterfaceKind};
pub use node::{InterfaceSelection, Node};
pub use states::{Fault, Health, PowerState, ProvisionState, ProvisionVerb, TransitionTable};
