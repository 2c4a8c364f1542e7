use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Bluetooth address of a peripheral.
///
/// Backends map their native identifier onto this: a MAC string where the
/// platform exposes one, the platform peripheral id otherwise. Stored upper-case
/// so comparisons are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Format a 48-bit MAC held in the low bytes of a `u64`
    pub fn from_mac(raw: u64) -> Self {
        let bytes = raw.to_be_bytes();
        let parts: Vec<String> = bytes[2..].iter().map(|b| format!("{:02X}", b)).collect();
        Self(parts.join(":"))
    }

    /// Parse back into a 48-bit MAC, if this address is one
    pub fn to_mac(&self) -> Option<u64> {
        let parts: Vec<&str> = self.0.split(':').collect();
        if parts.len() != 6 || parts.iter().any(|p| p.len() != 2) {
            return None;
        }
        u64::from_str_radix(&parts.concat(), 16).ok()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err("empty device address".to_string());
        }
        Ok(Self::new(s))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.0
    }
}

/// A single advertisement observed while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub address: DeviceAddress,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

impl ScanResult {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            local_name: None,
            service_uuids: Vec::new(),
            rssi: None,
        }
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn has_service_uuid(&self, uuid: &Uuid) -> bool {
        self.service_uuids.contains(uuid)
    }

    /// Advertised name, or an empty string when the advertisement carried none
    pub fn local_name(&self) -> &str {
        self.local_name.as_deref().unwrap_or("")
    }
}
