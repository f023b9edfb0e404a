//! Conductor configuration
//!
//! Centralized configuration with environment variable overrides. Retry
//! budgets are per-backend data handed to the action executor with each
//! call; different hardware classes have very different latency and
//! flakiness profiles, so none of these are hard-coded in the engine.

use crate::executor::RetryPolicy;
use anvil_core::InterfaceKind;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use strum::IntoEnumIterator;

#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Stable identity used as the reservation token and in history
    /// entries (env: CONDUCTOR_ID).
    pub conductor_id: String,

    /// Only nodes in this group are managed by this conductor
    /// (env: CONDUCTOR_GROUP).
    pub conductor_group: String,

    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated).
    pub etcd_endpoints: Vec<String>,

    // Liveness settings
    /// TTL for the conductor's etcd lease (seconds).
    pub lease_ttl: i64,

    /// Interval between liveness heartbeats (1/3 of TTL recommended).
    pub heartbeat_interval: Duration,

    /// A conductor silent for longer than this is dead; its reservations
    /// become stealable.
    pub dead_conductor_timeout: Duration,

    // Resync settings
    /// Interval between periodic power state resync sweeps
    /// (env: RESYNC_INTERVAL_SECS).
    pub resync_interval: Duration,

    /// Delay before the first sweep after startup.
    pub resync_initial_delay: Duration,

    // Etcd backoff settings
    /// Initial interval for etcd connection retry.
    pub etcd_backoff_initial: Duration,

    /// Maximum interval for etcd connection retry.
    pub etcd_backoff_max: Duration,

    /// Maximum elapsed time for etcd connection retries.
    pub etcd_backoff_max_elapsed: Duration,

    /// Multiplier for etcd backoff.
    pub etcd_backoff_multiplier: f64,

    // Driver settings
    /// Enabled implementation names per capability kind.
    pub enabled_interfaces: HashMap<InterfaceKind, HashSet<String>>,

    /// Retry budgets keyed by driver name.
    pub retry_policies: HashMap<String, RetryPolicy>,

    /// Budget for drivers with no explicit entry.
    pub default_retry_policy: RetryPolicy,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        // Every kind starts with the fake hardware type enabled; real
        // backends are opted in per deployment.
        let mut enabled_interfaces = HashMap::new();
        for kind in InterfaceKind::iter() {
            let mut names = HashSet::new();
            names.insert(format!("fake-{kind}"));
            enabled_interfaces.insert(kind, names);
        }

        // Observed budgets for the supported hardware classes.
        let mut retry_policies = HashMap::new();
        retry_policies.insert(
            "amt".to_string(),
            RetryPolicy::new(3, Duration::from_secs(10)),
        );
        retry_policies.insert(
            "iboot".to_string(),
            RetryPolicy::new(3, Duration::from_secs(1)),
        );
        retry_policies.insert(
            "seamicro".to_string(),
            RetryPolicy::new(3, Duration::from_secs(10)),
        );
        retry_policies.insert(
            "cisco-ucs".to_string(),
            RetryPolicy::new(6, Duration::from_secs(5)),
        );
        retry_policies.insert(
            "ssh-libvirt".to_string(),
            RetryPolicy::new(3, Duration::from_secs(3)),
        );
        retry_policies.insert(
            "fake".to_string(),
            RetryPolicy::new(3, Duration::from_millis(10)),
        );

        Self {
            conductor_id: format!("anvil-conductor-{}", uuid::Uuid::new_v4()),
            conductor_group: "default".to_string(),
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            lease_ttl: 15,
            heartbeat_interval: Duration::from_secs(5),
            dead_conductor_timeout: Duration::from_secs(90),
            resync_interval: Duration::from_secs(60),
            resync_initial_delay: Duration::from_secs(5),
            etcd_backoff_initial: Duration::from_secs(1),
            etcd_backoff_max: Duration::from_secs(10),
            etcd_backoff_max_elapsed: Duration::from_secs(60),
            etcd_backoff_multiplier: 2.0,
            enabled_interfaces,
            retry_policies,
            default_retry_policy: RetryPolicy::new(3, Duration::from_secs(1)),
        }
    }
}

impl ConductorConfig {
    /// Create configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = std::env::var("CONDUCTOR_ID") {
            config.conductor_id = id;
        }

        if let Ok(group) = std::env::var("CONDUCTOR_GROUP") {
            config.conductor_group = group;
        }

        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            config.etcd_endpoints = endpoints.split(',').map(String::from).collect();
        }

        if let Ok(secs) = std::env::var("RESYNC_INTERVAL_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                config.resync_interval = Duration::from_secs(parsed);
            }
        }

        if let Ok(secs) = std::env::var("DEAD_CONDUCTOR_TIMEOUT_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                config.dead_conductor_timeout = Duration::from_secs(parsed);
            }
        }

        config
    }

    /// Retry budget for `driver`.
    pub fn retry_policy_for(&self, driver: &str) -> RetryPolicy {
        self.retry_policies
            .get(driver)
            .copied()
            .unwrap_or(self.default_retry_policy)
    }

    /// Enable `impl_name` under `kind`.
    pub fn enable_interface(&mut self, kind: InterfaceKind, impl_name: &str) {
        self.enabled_interfaces
            .entry(kind)
            .or_default()
            .insert(impl_name.to_string());
    }

    /// Disable `impl_name` under `kind`.
    pub fn disable_interface(&mut self, kind: InterfaceKind, impl_name: &str) {
        if let Some(names) = self.enabled_interfaces.get_mut(&kind) {
            names.remove(impl_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_driver_budgets_override_the_default() {
        let config = ConductorConfig::default();
        let ucs = config.retry_policy_for("cisco-ucs");
        assert_eq!(ucs.max_attempts, 6);
        assert_eq!(ucs.attempt_interval, Duration::from_secs(5));

        let unknown = config.retry_policy_for("no-such-driver");
        assert_eq!(unknown, config.default_retry_policy);
    }

    #[test]
    fn fake_interfaces_are_enabled_by_default() {
        let config = ConductorConfig::default();
        assert!(config.enabled_interfaces[&InterfaceKind::Power].contains("fake-power"));
        assert!(config.enabled_interfaces[&InterfaceKind::Vendor].contains("fake-vendor"));
    }
}
