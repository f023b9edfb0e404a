//! Hardware driver implementations shipped with the conductor.
//!
//! Real backends (IPMI-class BMCs, AMT, iBoot, chassis managers) live
//! behind the capability traits in `anvil-core`; this module carries the
//! fake hardware type used by tests and single-process demos.

pub mod fake;

pub use fake::FakeHardware;
