//! Observability: structured events and Prometheus metrics.

pub mod events;
pub mod metrics;
