//! Anvil Conductor Library
//!
//! Lifecycle orchestration for a fleet of bare-metal machines: per-node
//! actors drive power and provisioning operations through hardware
//! capability interfaces, serialized across conductors by reservations in
//! shared storage.

pub mod actors;
pub mod config;
pub mod drivers;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod reservation;
pub mod store;
