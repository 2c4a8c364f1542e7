use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "monocle".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,
    #[serde(default = "default_rx_uuid")]
    pub rx_char_uuid: Uuid,
    #[serde(default = "default_tx_uuid")]
    pub tx_char_uuid: Uuid,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// 0 scans until a device shows up
    #[serde(default)]
    pub scan_timeout_secs: u64,
    /// Capped by the transport's own write limit
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default)]
    pub connection_timeout_secs: Option<u64>,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            rx_char_uuid: default_rx_uuid(),
            tx_char_uuid: default_tx_uuid(),
            device_name: default_device_name(),
            scan_timeout_secs: 0,
            max_chunk_size: default_max_chunk_size(),
            connection_timeout_secs: None,
        }
    }
}

fn default_service_uuid() -> Uuid {
    protocol::SERVICE_UUID
}
fn default_rx_uuid() -> Uuid {
    protocol::RX_CHAR_UUID
}
fn default_tx_uuid() -> Uuid {
    protocol::TX_CHAR_UUID
}
fn default_device_name() -> String {
    protocol::DEVICE_NAME.to_string()
}
fn default_max_chunk_size() -> usize {
    protocol::MAX_WRITE_SIZE
}

/// What the liveness loop does when a poll write fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LivenessPolicy {
    /// Stop polling and report the failure
    #[default]
    Exit,
    /// Scan for the device again and resume polling
    Reconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    /// Offset handed to `time.zone()` on the device
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    #[serde(default)]
    pub liveness_policy: LivenessPolicy,
    /// How long `clock` waits for device output before exiting
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            brightness: default_brightness(),
            liveness_interval_secs: default_liveness_interval_secs(),
            liveness_policy: LivenessPolicy::default(),
            settle_secs: default_settle_secs(),
        }
    }
}

fn default_timezone() -> String {
    "-8:00".to_string()
}
fn default_brightness() -> u8 {
    4
}
fn default_liveness_interval_secs() -> u64 {
    10
}
fn default_settle_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ble: BleSettings,

    #[serde(default)]
    pub driver: DriverSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from `path`, falling back to defaults if it is missing or unreadable
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let settings_path = path.into();
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("monocle");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
