//! Prometheus Metrics
//!
//! Defines and initializes all Prometheus metrics for the conductor.
//!
//! Metrics tracked:
//! - `anvil_power_actions_total` - power actions by outcome
//! - `anvil_provision_actions_total` - provisioning actions by verb and outcome
//! - `anvil_retries_exhausted_total` - actions that spent their whole budget
//! - `anvil_reservation_conflicts_total` - acquire attempts that lost the race
//! - `anvil_reservations_stolen_total` - takeovers from dead conductors
//! - `anvil_audit_write_failures_total` - history appends that failed
//! - `anvil_nodes_by_provision_state` - gauge of managed nodes by state
//! - `anvil_node_actors` - gauge of live node actors

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// State containing the Prometheus handle for metrics export.
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

/// Initialize the Prometheus recorder and register all metric
/// descriptions.
pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "anvil_power_actions_total",
        "Power actions performed, labeled by outcome"
    );
    describe_counter!(
        "anvil_provision_actions_total",
        "Provisioning actions performed, labeled by verb and outcome"
    );
    describe_counter!(
        "anvil_retries_exhausted_total",
        "Actions that exhausted their retry budget"
    );
    describe_counter!(
        "anvil_reservation_conflicts_total",
        "Reservation acquires that found a live holder"
    );
    describe_counter!(
        "anvil_reservations_stolen_total",
        "Reservations taken over from dead conductors"
    );
    describe_counter!(
        "anvil_audit_write_failures_total",
        "History appends that failed after a successful action"
    );
    describe_gauge!(
        "anvil_nodes_by_provision_state",
        "Number of managed nodes by provisioning state"
    );
    describe_gauge!("anvil_node_actors", "Number of live node actors");
}

/// Record a power action outcome.
pub fn record_power_action(outcome: &str) {
    counter!("anvil_power_actions_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a provisioning action outcome.
pub fn record_provision_action(verb: &str, outcome: &str) {
    counter!(
        "anvil_provision_actions_total",
        "verb" => verb.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retry budget exhaustion.
pub fn record_retries_exhausted() {
    counter!("anvil_retries_exhausted_total").increment(1);
}

/// Record a reservation conflict with a live holder.
pub fn record_reservation_conflict() {
    counter!("anvil_reservation_conflicts_total").increment(1);
}

/// Record a reservation takeover.
pub fn record_reservation_stolen() {
    counter!("anvil_reservations_stolen_total").increment(1);
}

/// Record a failed history append.
pub fn record_audit_write_failure() {
    counter!("anvil_audit_write_failures_total").increment(1);
}

/// Update the nodes-by-state gauge.
pub fn set_nodes_by_provision_state(state: &str, count: usize) {
    gauge!(
        "anvil_nodes_by_provision_state",
        "state" => state.to_string()
    )
    .set(count as f64);
}

/// Update the live node actor gauge.
pub fn set_node_actor_count(count: usize) {
    gauge!("anvil_node_actors").set(count as f64);
}
