//! BLE Scanner Module
//!
//! Decides which advertisement is the Monocle we want to connect to.

use crate::domain::models::{DeviceAddress, ScanResult};
use crate::infrastructure::bluetooth::protocol;
use uuid::Uuid;

/// How a scan picks its target once the service UUID has matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanMode {
    /// First peripheral advertising the service
    AnyService,
    /// Advertised local name must equal this value
    Named(String),
    /// Peripheral address must equal this value
    Address(DeviceAddress),
}

/// Predicate applied to every advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Uuid,
    pub mode: ScanMode,
}

impl ScanFilter {
    pub fn any_service(service_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            mode: ScanMode::AnyService,
        }
    }

    pub fn named(service_uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            service_uuid,
            mode: ScanMode::Named(name.into()),
        }
    }

    pub fn address(service_uuid: Uuid, address: DeviceAddress) -> Self {
        Self {
            service_uuid,
            mode: ScanMode::Address(address),
        }
    }

    /// Check if this advertisement is the device we are looking for
    pub fn matches(&self, result: &ScanResult) -> bool {
        if !result.has_service_uuid(&self.service_uuid) {
            return false;
        }

        match &self.mode {
            ScanMode::AnyService => true,
            ScanMode::Named(name) => result.local_name() == name,
            ScanMode::Address(address) => &result.address == address,
        }
    }
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self::named(protocol::SERVICE_UUID, protocol::DEVICE_NAME)
    }
}
