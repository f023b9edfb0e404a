//! Capability registry
//!
//! An explicit registration table populated at process start: every
//! capability implementation is registered under its namespace, every
//! hardware type declares which implementations it supports, and resolution
//! filters against the configured enabled-set plus each implementation's
//! runtime self-check. No dynamic loading.

use anvil_core::{AnvilError, InterfaceImpl, InterfaceKind, Node};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A hardware type manifest: which implementation names a driver supports
/// per capability kind.
#[derive(Debug, Clone)]
pub struct HardwareType {
    pub name: String,
    supported: HashMap<InterfaceKind, Vec<String>>,
}

impl HardwareType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            supported: HashMap::new(),
        }
    }

    /// Declare support for `impl_name` under `kind`. Order matters: the
    /// first supported name is the driver's default selection.
    pub fn support(mut self, kind: InterfaceKind, impl_name: &str) -> Self {
        self.supported.entry(kind).or_default().push(impl_name.to_string());
        self
    }

    pub fn supports(&self, kind: InterfaceKind, impl_name: &str) -> bool {
        self.supported
            .get(&kind)
            .is_some_and(|names| names.iter().any(|n| n == impl_name))
    }
}

/// Registry of capability implementations and hardware type manifests.
///
/// Built once at startup and shared read-only afterwards; resolution takes
/// `&self` and never blocks.
pub struct DriverRegistry {
    enabled: HashMap<InterfaceKind, HashSet<String>>,
    implementations: HashMap<InterfaceKind, Vec<InterfaceImpl>>,
    hardware_types: HashMap<String, HardwareType>,
}

impl DriverRegistry {
    pub fn new(enabled: HashMap<InterfaceKind, HashSet<String>>) -> Self {
        Self {
            enabled,
            implementations: HashMap::new(),
            hardware_types: HashMap::new(),
        }
    }

    /// Register one implementation under its namespace.
    pub fn register(&mut self, implementation: InterfaceImpl) {
        self.implementations
            .entry(implementation.kind())
            .or_default()
            .push(implementation);
    }

    pub fn register_hardware_type(&mut self, hardware_type: HardwareType) {
        self.hardware_types
            .insert(hardware_type.name.clone(), hardware_type);
    }

    pub fn hardware_type(&self, driver: &str) -> Option<&HardwareType> {
        self.hardware_types.get(driver)
    }

    /// Resolve the active implementation named `selection` under `kind` for
    /// `driver`.
    ///
    /// An implementation is active iff its name is in the enabled-set for
    /// the namespace and its runtime self-check passes. The two rejection
    /// reasons are logged separately so an operator can tell a config gap
    /// from a backend reporting itself unusable.
    pub fn resolve(
        &self,
        kind: InterfaceKind,
        driver: &str,
        selection: &str,
    ) -> Result<InterfaceImpl, AnvilError> {
        let hardware_type = self
            .hardware_types
            .get(driver)
            .ok_or_else(|| AnvilError::UnknownDriver(driver.to_string()))?;

        if !hardware_type.supports(kind, selection) {
            return Err(AnvilError::InterfaceNotAvailable {
                kind,
                driver: driver.to_string(),
                reason: format!("driver does not list implementation {selection}"),
            });
        }

        let enabled = self.enabled.get(&kind);
        let mut rejection: Option<String> = None;

        for implementation in self.implementations.get(&kind).into_iter().flatten() {
            let name = implementation.name();
            let enabled_by_config = enabled.is_some_and(|set| set.contains(name));
            if !enabled_by_config {
                debug!(
                    kind = %kind,
                    implementation = name,
                    "skipping implementation disabled by configuration"
                );
                if name == selection {
                    rejection = Some("disabled by configuration".to_string());
                }
                continue;
            }
            if !implementation.is_enabled() {
                debug!(
                    kind = %kind,
                    implementation = name,
                    "skipping implementation whose self-check reports disabled"
                );
                if name == selection {
                    rejection = Some("implementation reports itself disabled".to_string());
                }
                continue;
            }
            if name == selection {
                return Ok(implementation.clone());
            }
        }

        Err(AnvilError::InterfaceNotAvailable {
            kind,
            driver: driver.to_string(),
            reason: rejection.unwrap_or_else(|| format!("{selection} is not registered")),
        })
    }

    /// Resolve using the node's per-capability selection.
    pub fn resolve_for_node(
        &self,
        kind: InterfaceKind,
        node: &Node,
    ) -> Result<InterfaceImpl, AnvilError> {
        self.resolve(kind, &node.driver, node.interfaces.get(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::interfaces::PowerInterface;
    use anvil_core::{Extension, HardwareError, PowerState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TestPower {
        name: String,
        enabled: Arc<AtomicBool>,
    }

    impl Extension for TestPower {
        fn name(&self) -> &str {
            &self.name
        }
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PowerInterface for TestPower {
        async fn get_power_state(&self, _node: &Node) -> Result<PowerState, HardwareError> {
            Ok(PowerState::Off)
        }
        async fn set_power_state(
            &self,
            _node: &Node,
            _target: PowerState,
        ) -> Result<(), HardwareError> {
            Ok(())
        }
        async fn reboot(&self, _node: &Node) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    fn registry_with(enabled_names: &[&str], self_enabled: Arc<AtomicBool>) -> DriverRegistry {
        let mut enabled = HashMap::new();
        enabled.insert(
            InterfaceKind::Power,
            enabled_names.iter().map(|s| s.to_string()).collect(),
        );
        let mut registry = DriverRegistry::new(enabled);
        registry.register(InterfaceImpl::Power(Arc::new(TestPower {
            name: "acme-power".to_string(),
            enabled: self_enabled,
        })));
        registry.register_hardware_type(
            HardwareType::new("acme").support(InterfaceKind::Power, "acme-power"),
        );
        registry
    }

    #[test]
    fn enabled_implementation_resolves() {
        let registry = registry_with(&["acme-power"], Arc::new(AtomicBool::new(true)));
        let resolved = registry
            .resolve(InterfaceKind::Power, "acme", "acme-power")
            .unwrap();
        assert_eq!(resolved.name(), "acme-power");
    }

    #[test]
    fn config_disabled_implementation_is_not_available() {
        let registry = registry_with(&[], Arc::new(AtomicBool::new(true)));
        let err = registry
            .resolve(InterfaceKind::Power, "acme", "acme-power")
            .unwrap_err();
        match err {
            AnvilError::InterfaceNotAvailable { reason, .. } => {
                assert!(reason.contains("configuration"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn self_check_failure_is_reported_distinctly() {
        let self_enabled = Arc::new(AtomicBool::new(true));
        let registry = registry_with(&["acme-power"], Arc::clone(&self_enabled));

        // Flip the runtime self-check after registration; resolution
        // re-evaluates it at query time.
        self_enabled.store(false, Ordering::SeqCst);
        let err = registry
            .resolve(InterfaceKind::Power, "acme", "acme-power")
            .unwrap_err();
        match err {
            AnvilError::InterfaceNotAvailable { reason, .. } => {
                assert!(reason.contains("itself disabled"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_driver_is_a_configuration_error() {
        let registry = registry_with(&["acme-power"], Arc::new(AtomicBool::new(true)));
        assert!(matches!(
            registry.resolve(InterfaceKind::Power, "nope", "acme-power"),
            Err(AnvilError::UnknownDriver(_))
        ));
    }

    #[test]
    fn driver_must_list_the_selection() {
        let registry = registry_with(&["acme-power"], Arc::new(AtomicBool::new(true)));
        assert!(matches!(
            registry.resolve(InterfaceKind::Power, "acme", "other-power"),
            Err(AnvilError::InterfaceNotAvailable { .. })
        ));
    }
}
