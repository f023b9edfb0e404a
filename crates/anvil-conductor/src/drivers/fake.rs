//! Fake hardware type
//!
//! Every interface succeeds instantly unless failures are scripted onto
//! it. Tests use the scripting to exercise retry and fault paths; the
//! instances also count their calls so suppression properties (idempotent
//! no-op, maintenance sweeps) can assert zero hardware activity.

use crate::registry::{DriverRegistry, HardwareType};
use anvil_core::interfaces::{
    BiosInterface, BootInterface, ConsoleInterface, DeployInterface, FirmwareInterface,
    InspectInterface, ManagementInterface, PowerInterface, RaidInterface, RescueInterface,
    VendorInterface,
};
use anvil_core::{BootDevice, Extension, HardwareError, InterfaceKind, Node, PowerState};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const FAKE_DRIVER: &str = "fake";

/// Shared scripting/accounting for one fake interface.
#[derive(Default)]
pub struct Script {
    calls: AtomicU32,
    queued: Mutex<VecDeque<HardwareError>>,
}

impl Script {
    /// Queue a failure to be returned by the next call.
    pub fn push_failure(&self, err: HardwareError) {
        self.queued.lock().unwrap().push_back(err);
    }

    /// Queue `n` retryable failures.
    pub fn fail_retryable(&self, n: u32) {
        for _ in 0..n {
            self.push_failure(HardwareError::Retryable("scripted failure".to_string()));
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Drop any failures still queued.
    pub fn clear(&self) {
        self.queued.lock().unwrap().clear();
    }

    fn next(&self) -> Result<(), HardwareError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.queued.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct FakePower {
    pub script: Script,
    state: Mutex<PowerState>,
}

impl Default for FakePower {
    fn default() -> Self {
        Self {
            script: Script::default(),
            state: Mutex::new(PowerState::Off),
        }
    }
}

impl FakePower {
    pub fn set_observed_state(&self, state: PowerState) {
        *self.state.lock().unwrap() = state;
    }
}

impl Extension for FakePower {
    fn name(&self) -> &str {
        "fake-power"
    }
}

#[async_trait]
impl PowerInterface for FakePower {
    async fn get_power_state(&self, _node: &Node) -> Result<PowerState, HardwareError> {
        self.script.next()?;
        Ok(*self.state.lock().unwrap())
    }

    async fn set_power_state(
        &self,
        _node: &Node,
        target: PowerState,
    ) -> Result<(), HardwareError> {
        self.script.next()?;
        *self.state.lock().unwrap() = target.settled();
        Ok(())
    }

    async fn reboot(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()?;
        *self.state.lock().unwrap() = PowerState::On;
        Ok(())
    }
}

pub struct FakeManagement {
    pub script: Script,
    boot_device: Mutex<BootDevice>,
}

impl Default for FakeManagement {
    fn default() -> Self {
        Self {
            script: Script::default(),
            boot_device: Mutex::new(BootDevice::Disk),
        }
    }
}

impl Extension for FakeManagement {
    fn name(&self) -> &str {
        "fake-management"
    }
}

#[async_trait]
impl ManagementInterface for FakeManagement {
    async fn get_boot_device(&self, _node: &Node) -> Result<BootDevice, HardwareError> {
        self.script.next()?;
        Ok(*self.boot_device.lock().unwrap())
    }

    async fn set_boot_device(
        &self,
        _node: &Node,
        device: BootDevice,
        _persistent: bool,
    ) -> Result<(), HardwareError> {
        self.script.next()?;
        *self.boot_device.lock().unwrap() = device;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeDeploy {
    pub script: Script,
}

impl Extension for FakeDeploy {
    fn name(&self) -> &str {
        "fake-deploy"
    }
}

#[async_trait]
impl DeployInterface for FakeDeploy {
    async fn prepare(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn deploy(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn tear_down(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeRescue {
    pub script: Script,
}

impl Extension for FakeRescue {
    fn name(&self) -> &str {
        "fake-rescue"
    }
}

#[async_trait]
impl RescueInterface for FakeRescue {
    async fn rescue(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn unrescue(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeBoot {
    pub script: Script,
}

impl Extension for FakeBoot {
    fn name(&self) -> &str {
        "fake-boot"
    }
}

#[async_trait]
impl BootInterface for FakeBoot {
    async fn prepare_boot(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn clean_up_boot(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeRaid {
    pub script: Script,
}

impl Extension for FakeRaid {
    fn name(&self) -> &str {
        "fake-raid"
    }
}

#[async_trait]
impl RaidInterface for FakeRaid {
    async fn create_configuration(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn delete_configuration(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeBios {
    pub script: Script,
}

impl Extension for FakeBios {
    fn name(&self) -> &str {
        "fake-bios"
    }
}

#[async_trait]
impl BiosInterface for FakeBios {
    async fn apply_configuration(
        &self,
        _node: &Node,
        _settings: &serde_json::Value,
    ) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn factory_reset(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeFirmware {
    pub script: Script,
}

impl Extension for FakeFirmware {
    fn name(&self) -> &str {
        "fake-firmware"
    }
}

#[async_trait]
impl FirmwareInterface for FakeFirmware {
    async fn update(
        &self,
        _node: &Node,
        _components: &serde_json::Value,
    ) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeInspect {
    pub script: Script,
}

impl Extension for FakeInspect {
    fn name(&self) -> &str {
        "fake-inspect"
    }
}

#[async_trait]
impl InspectInterface for FakeInspect {
    async fn inspect(&self, _node: &Node) -> Result<serde_json::Value, HardwareError> {
        self.script.next()?;
        Ok(serde_json::json!({ "cpus": 8, "memory_mb": 32768 }))
    }
}

#[derive(Default)]
pub struct FakeConsole {
    pub script: Script,
}

impl Extension for FakeConsole {
    fn name(&self) -> &str {
        "fake-console"
    }
}

#[async_trait]
impl ConsoleInterface for FakeConsole {
    async fn start_console(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }

    async fn stop_console(&self, _node: &Node) -> Result<(), HardwareError> {
        self.script.next()
    }
}

#[derive(Default)]
pub struct FakeVendor {
    pub script: Script,
}

impl Extension for FakeVendor {
    fn name(&self) -> &str {
        "fake-vendor"
    }
}

#[async_trait]
impl VendorInterface for FakeVendor {
    async fn passthru(
        &self,
        _node: &Node,
        method: &str,
        _args: &serde_json::Value,
    ) -> Result<serde_json::Value, HardwareError> {
        self.script.next()?;
        Ok(serde_json::json!({ "method": method, "result": "ok" }))
    }
}

/// One full fake hardware type: handles to every interface instance plus
/// the registration glue.
pub struct FakeHardware {
    pub power: Arc<FakePower>,
    pub management: Arc<FakeManagement>,
    pub boot: Arc<FakeBoot>,
    pub deploy: Arc<FakeDeploy>,
    pub raid: Arc<FakeRaid>,
    pub bios: Arc<FakeBios>,
    pub firmware: Arc<FakeFirmware>,
    pub inspect: Arc<FakeInspect>,
    pub rescue: Arc<FakeRescue>,
    pub console: Arc<FakeConsole>,
    pub vendor: Arc<FakeVendor>,
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHardware {
    pub fn new() -> Self {
        Self {
            power: Arc::new(FakePower::default()),
            management: Arc::new(FakeManagement::default()),
            boot: Arc::new(FakeBoot::default()),
            deploy: Arc::new(FakeDeploy::default()),
            raid: Arc::new(FakeRaid::default()),
            bios: Arc::new(FakeBios::default()),
            firmware: Arc::new(FakeFirmware::default()),
            inspect: Arc::new(FakeInspect::default()),
            rescue: Arc::new(FakeRescue::default()),
            console: Arc::new(FakeConsole::default()),
            vendor: Arc::new(FakeVendor::default()),
        }
    }

    /// Register every fake interface and the `fake` manifest.
    pub fn install(&self, registry: &mut DriverRegistry) {
        use anvil_core::InterfaceImpl;

        registry.register(InterfaceImpl::Power(Arc::clone(&self.power) as _));
        registry.register(InterfaceImpl::Management(Arc::clone(&self.management) as _));
        registry.register(InterfaceImpl::Boot(Arc::clone(&self.boot) as _));
        registry.register(InterfaceImpl::Deploy(Arc::clone(&self.deploy) as _));
        registry.register(InterfaceImpl::Raid(Arc::clone(&self.raid) as _));
        registry.register(InterfaceImpl::Bios(Arc::clone(&self.bios) as _));
        registry.register(InterfaceImpl::Firmware(Arc::clone(&self.firmware) as _));
        registry.register(InterfaceImpl::Inspect(Arc::clone(&self.inspect) as _));
        registry.register(InterfaceImpl::Rescue(Arc::clone(&self.rescue) as _));
        registry.register(InterfaceImpl::Console(Arc::clone(&self.console) as _));
        registry.register(InterfaceImpl::Vendor(Arc::clone(&self.vendor) as _));
        registry.register_hardware_type(Self::hardware_type());
    }

    /// Manifest for the fake hardware type.
    pub fn hardware_type() -> HardwareType {
        HardwareType::new(FAKE_DRIVER)
            .support(InterfaceKind::Power, "fake-power")
            .support(InterfaceKind::Management, "fake-management")
            .support(InterfaceKind::Boot, "fake-boot")
            .support(InterfaceKind::Deploy, "fake-deploy")
            .support(InterfaceKind::Raid, "fake-raid")
            .support(InterfaceKind::Bios, "fake-bios")
            .support(InterfaceKind::Firmware, "fake-firmware")
            .support(InterfaceKind::Inspect, "fake-inspect")
            .support(InterfaceKind::Rescue, "fake-rescue")
            .support(InterfaceKind::Console, "fake-console")
            .support(InterfaceKind::Vendor, "fake-vendor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_drain_in_order() {
        let power = FakePower::default();
        power.script.fail_retryable(1);
        power
            .script
            .push_failure(HardwareError::Fatal("bad credentials".to_string()));

        let node = Node::new(FAKE_DRIVER);
        assert!(matches!(
            power.set_power_state(&node, PowerState::On).await,
            Err(HardwareError::Retryable(_))
        ));
        assert!(matches!(
            power.set_power_state(&node, PowerState::On).await,
            Err(HardwareError::Fatal(_))
        ));
        power.set_power_state(&node, PowerState::On).await.unwrap();
        assert_eq!(power.script.calls(), 3);
        assert_eq!(
            power.get_power_state(&node).await.unwrap(),
            PowerState::On
        );
    }
}
