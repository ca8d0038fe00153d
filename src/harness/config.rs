use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::harness::error::{DeviceError, SyncErrorCode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSettings {
    /// Max wait for a device to report online after boot/reconnect, in ms.
    pub online_timeout_ms: u64,
    /// Max wait for a device to become fully available (booted, responsive).
    pub available_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Budget for slow bootloader operations (flash, format).
    pub long_command_timeout_ms: u64,
    pub fastboot_timeout_ms: u64,
    pub recovery_mode_timeout_ms: u64,
    /// How long a device may take to disappear after a reboot command.
    pub unavailable_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            online_timeout_ms: 60_000,
            available_timeout_ms: 6 * 60_000,
            command_timeout_ms: 2 * 60_000,
            long_command_timeout_ms: 25 * 60_000,
            fastboot_timeout_ms: 60_000,
            recovery_mode_timeout_ms: 60_000,
            unavailable_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RebootSettings {
    pub reboot_timeout_ms: u64,
    /// When > 0, wait for a second reboot after a userdata wipe; some storage
    /// layouts recreate the filesystem asynchronously after erase.
    pub unencrypt_reboot_timeout_ms: u64,
    /// Shell commands run after every boot, in order.
    pub post_boot_commands: Vec<String>,
    pub disable_keyguard: bool,
    pub disable_keyguard_cmd: String,
}

impl Default for RebootSettings {
    fn default() -> Self {
        Self {
            reboot_timeout_ms: 6 * 60_000,
            unencrypt_reboot_timeout_ms: 0,
            post_boot_commands: Vec::new(),
            disable_keyguard: true,
            disable_keyguard_cmd: "input keyevent 82".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WifiSettings {
    pub retry_count: u32,
    pub backoff_base_ms: u64,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            retry_count: 4,
            backoff_base_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncSettings {
    /// Sync error codes treated as transient channel faults worth a recovery
    /// cycle. Everything else is a logic error and aborts retrying.
    pub transient_error_codes: Vec<SyncErrorCode>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            transient_error_codes: vec![
                SyncErrorCode::BufferOverrun,
                SyncErrorCode::TransferProtocolError,
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactSettings {
    /// Cap on captured logcat/bugreport bytes.
    pub max_log_data_bytes: u64,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            max_log_data_bytes: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// The options surface consumed (not owned) by the device layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOptions {
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub reboot: RebootSettings,
    #[serde(default)]
    pub wifi: WifiSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub artifacts: ArtifactSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default = "default_true")]
    pub enable_root: bool,
    /// `fastboot erase` vs `fastboot format` for partition wipes.
    #[serde(default)]
    pub use_fastboot_erase: bool,
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    #[serde(default = "default_fastboot_path")]
    pub fastboot_path: String,
    /// Retry budget for device actions.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: usize,
}

fn default_true() -> bool {
    true
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_fastboot_path() -> String {
    "fastboot".to_string()
}

fn default_max_retry_attempts() -> usize {
    2
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            timeouts: TimeoutSettings::default(),
            reboot: RebootSettings::default(),
            wifi: WifiSettings::default(),
            sync: SyncSettings::default(),
            artifacts: ArtifactSettings::default(),
            logging: LoggingSettings::default(),
            enable_root: true,
            use_fastboot_erase: false,
            adb_path: default_adb_path(),
            fastboot_path: default_fastboot_path(),
            max_retry_attempts: default_max_retry_attempts(),
        }
    }
}

impl HarnessOptions {
    pub fn is_transient_sync_error(&self, code: SyncErrorCode) -> bool {
        self.sync.transient_error_codes.contains(&code)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("DEVICE_HARNESS_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".device_harness_config.json")
}

pub fn backup_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".device_harness_config.backup.json")
}

pub fn load_config() -> Result<HarnessOptions, DeviceError> {
    load_config_from_path(&config_path())
}

pub fn save_config(options: &HarnessOptions) -> Result<(), DeviceError> {
    save_config_to_path(options, &config_path(), &backup_config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<HarnessOptions, DeviceError> {
    if !path.exists() {
        return Ok(HarnessOptions::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| DeviceError::Config(format!("failed to read config: {err}")))?;
    let options: HarnessOptions = serde_json::from_str(&raw)
        .map_err(|err| DeviceError::Config(format!("failed to parse config: {err}")))?;
    Ok(validate_config(options))
}

pub fn save_config_to_path(
    options: &HarnessOptions,
    path: &Path,
    backup_path: &Path,
) -> Result<(), DeviceError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(options)
        .map_err(|err| DeviceError::Config(format!("failed to serialize config: {err}")))?;
    fs::write(path, payload)
        .map_err(|err| DeviceError::Config(format!("failed to write config: {err}")))?;
    Ok(())
}

fn validate_config(mut options: HarnessOptions) -> HarnessOptions {
    let defaults = TimeoutSettings::default();
    if options.timeouts.command_timeout_ms < 1_000 {
        options.timeouts.command_timeout_ms = defaults.command_timeout_ms;
    }
    if options.timeouts.long_command_timeout_ms < options.timeouts.command_timeout_ms {
        options.timeouts.long_command_timeout_ms = defaults.long_command_timeout_ms;
    }
    if options.timeouts.online_timeout_ms < 1_000 {
        options.timeouts.online_timeout_ms = defaults.online_timeout_ms;
    }
    if options.timeouts.available_timeout_ms < options.timeouts.online_timeout_ms {
        options.timeouts.available_timeout_ms = defaults.available_timeout_ms;
    }
    if options.reboot.reboot_timeout_ms < 10_000 {
        options.reboot.reboot_timeout_ms = RebootSettings::default().reboot_timeout_ms;
    }
    if options.wifi.backoff_base_ms == 0 {
        options.wifi.backoff_base_ms = WifiSettings::default().backoff_base_ms;
    }
    if options.artifacts.max_log_data_bytes < 64 * 1024 {
        options.artifacts.max_log_data_bytes = ArtifactSettings::default().max_log_data_bytes;
    }
    if options.adb_path.trim().is_empty() {
        options.adb_path = default_adb_path();
    }
    if options.fastboot_path.trim().is_empty() {
        options.fastboot_path = default_fastboot_path();
    }
    options
}
