//! Hardware capability contract
//!
//! One trait per capability kind, all sharing the [`Extension`] base so the
//! registry can filter implementations uniformly. The wire protocol a backend
//! speaks (IPMI, WSMAN, SSH, ...) is entirely its own business; the engine
//! only sees these async methods and the retryable/fatal failure split.

use crate::node::Node;
use crate::states::PowerState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

/// The fixed set of capability namespaces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
    EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterfaceKind {
    Power,
    Management,
    Boot,
    Deploy,
    Raid,
    Bios,
    Firmware,
    Inspect,
    Rescue,
    Console,
    Vendor,
}

/// Failure reported by a hardware backend.
///
/// The split drives the action executor: retryable failures consume retry
/// budget, fatal ones abort immediately.
#[derive(Debug, Clone, Error)]
pub enum HardwareError {
    /// Transient condition (timeout, busy BMC, flaky channel).
    #[error("retryable hardware failure: {0}")]
    Retryable(String),
    /// Permanent condition (rejected credentials, unsupported operation).
    #[error("fatal hardware failure: {0}")]
    Fatal(String),
}

impl HardwareError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HardwareError::Retryable(_))
    }
}

/// Boot device selectable through a management interface.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BootDevice {
    Pxe,
    Disk,
    Cdrom,
    Bios,
}

/// Base contract shared by every capability implementation.
///
/// `is_enabled` is the runtime self-check: an implementation may report
/// itself unusable (missing local tooling, unreachable dependency) even when
/// configuration enables it.
pub trait Extension: Send + Sync {
    /// Name, unique within the implementation's namespace.
    fn name(&self) -> &str;

    /// Runtime self-check evaluated at resolution time.
    fn is_enabled(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait PowerInterface: Extension {
    async fn get_power_state(&self, node: &Node) -> Result<PowerState, HardwareError>;

    /// Drive the node to `target`. `target` is never [`PowerState::Unknown`].
    async fn set_power_state(&self, node: &Node, target: PowerState)
        -> Result<(), HardwareError>;

    async fn reboot(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait ManagementInterface: Extension {
    async fn get_boot_device(&self, node: &Node) -> Result<BootDevice, HardwareError>;

    async fn set_boot_device(
        &self,
        node: &Node,
        device: BootDevice,
        persistent: bool,
    ) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait BootInterface: Extension {
    async fn prepare_boot(&self, node: &Node) -> Result<(), HardwareError>;
    async fn clean_up_boot(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait DeployInterface: Extension {
    /// Ready a manageable node for scheduling.
    async fn prepare(&self, node: &Node) -> Result<(), HardwareError>;
    /// Write the instance image and boot into it.
    async fn deploy(&self, node: &Node) -> Result<(), HardwareError>;
    /// Undeploy and return the node to the pool.
    async fn tear_down(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait RaidInterface: Extension {
    async fn create_configuration(&self, node: &Node) -> Result<(), HardwareError>;
    async fn delete_configuration(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait BiosInterface: Extension {
    async fn apply_configuration(
        &self,
        node: &Node,
        settings: &serde_json::Value,
    ) -> Result<(), HardwareError>;
    async fn factory_reset(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait FirmwareInterface: Extension {
    async fn update(&self, node: &Node, components: &serde_json::Value)
        -> Result<(), HardwareError>;
}

#[async_trait]
pub trait InspectInterface: Extension {
    /// Interrogate the hardware and return discovered properties.
    async fn inspect(&self, node: &Node) -> Result<serde_json::Value, HardwareError>;
}

#[async_trait]
pub trait RescueInterface: Extension {
    async fn rescue(&self, node: &Node) -> Result<(), HardwareError>;
    async fn unrescue(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait ConsoleInterface: Extension {
    async fn start_console(&self, node: &Node) -> Result<(), HardwareError>;
    async fn stop_console(&self, node: &Node) -> Result<(), HardwareError>;
}

#[async_trait]
pub trait VendorInterface: Extension {
    /// Driver-specific passthrough call.
    async fn passthru(
        &self,
        node: &Node,
        method: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, HardwareError>;
}

/// A registered capability implementation, polymorphic over its namespace.
#[derive(Clone)]
pub enum InterfaceImpl {
    Power(Arc<dyn PowerInterface>),
    Management(Arc<dyn ManagementInterface>),
    Boot(Arc<dyn BootInterface>),
    Deploy(Arc<dyn DeployInterface>),
    Raid(Arc<dyn RaidInterface>),
    Bios(Arc<dyn BiosInterface>),
    Firmware(Arc<dyn FirmwareInterface>),
    Inspect(Arc<dyn InspectInterface>),
    Rescue(Arc<dyn RescueInterface>),
    Console(Arc<dyn ConsoleInterface>),
    Vendor(Arc<dyn VendorInterface>),
}

impl InterfaceImpl {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            InterfaceImpl::Power(_) => InterfaceKind::Power,
            InterfaceImpl::Management(_) => InterfaceKind::Management,
            InterfaceImpl::Boot(_) => InterfaceKind::Boot,
            InterfaceImpl::Deploy(_) => InterfaceKind::Deploy,
            InterfaceImpl::Raid(_) => InterfaceKind::Raid,
            InterfaceImpl::Bios(_) => InterfaceKind::Bios,
            InterfaceImpl::Firmware(_) => InterfaceKind::Firmware,
            InterfaceImpl::Inspect(_) => InterfaceKind::Inspect,
            InterfaceImpl::Rescue(_) => InterfaceKind::Rescue,
            InterfaceImpl::Console(_) => InterfaceKind::Console,
            InterfaceImpl::Vendor(_) => InterfaceKind::Vendor,
        }
    }

    pub fn name(&self) -> &str {
        self.as_extension().name()
    }

    pub fn is_enabled(&self) -> bool {
        self.as_extension().is_enabled()
    }

    fn as_extension(&self) -> &dyn Extension {
        match self {
            InterfaceImpl::Power(i) => i.as_ref(),
            InterfaceImpl::Management(i) => i.as_ref(),
            InterfaceImpl::Boot(i) => i.as_ref(),
            InterfaceImpl::Deploy(i) => i.as_ref(),
            InterfaceImpl::Raid(i) => i.as_ref(),
            InterfaceImpl::Bios(i) => i.as_ref(),
            InterfaceImpl::Firmware(i) => i.as_ref(),
            InterfaceImpl::Inspect(i) => i.as_ref(),
            InterfaceImpl::Rescue(i) => i.as_ref(),
            InterfaceImpl::Console(i) => i.as_ref(),
            InterfaceImpl::Vendor(i) => i.as_ref(),
        }
    }

    pub fn as_power(&self) -> Option<Arc<dyn PowerInterface>> {
        match self {
            InterfaceImpl::Power(i) => Some(Arc::clone(i)),
            _ => None,
        }
    }

    pub fn as_management(&self) -> Option<Arc<dyn ManagementInterface>> {
        match self {
            InterfaceImpl::Management(i) => Some(Arc::clone(i)),
            _ => None,
        }
    }

    pub fn as_deploy(&self) -> Option<Arc<dyn DeployInterface>> {
        match self {
            InterfaceImpl::Deploy(i) => Some(Arc::clone(i)),
            _ => None,
        }
    }

    pub fn as_rescue(&self) -> Option<Arc<dyn RescueInterface>> {
        match self {
            InterfaceImpl::Rescue(i) => Some(Arc::clone(i)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for InterfaceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceImpl")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}
