//! Engine configuration with JSON persistence.
//!
//! This module provides:
//! - `DfuConfig`, the knobs a CLI or GUI hands to the updater
//! - Persistence to a JSON file in an application data directory
//!
//! Every field is optional in JSON and falls back to the protocol defaults.
//! Durations are written as seconds (float), e.g. `"startDelay": 0.4`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dfu::config::{
    DEFAULT_BOOTLOADER_NAME, DEFAULT_PACKET_SIZE, DEFAULT_PRN, DEFAULT_RECEIPT_TIMEOUT,
    DEFAULT_RECONNECT_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT, DEFAULT_RETRY_BACKOFF,
    DEFAULT_RETRY_COUNT, DEFAULT_SCAN_TIMEOUT, DEFAULT_START_DELAY, DEFAULT_VALIDATION_TIMEOUT,
    MAX_PACKET_SIZE,
};
use crate::dfu::error::DfuError;

/// Engine configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DfuConfig {
    /// Data packets between receipt notifications; 0 disables receipts.
    pub prn: u16,

    /// Pause after Start DFU before the size packet.
    #[serde(with = "seconds")]
    pub start_delay: Duration,

    /// Length of one scan window.
    #[serde(with = "seconds")]
    pub scan_timeout: Duration,

    /// Additional attempts after the first one.
    pub retry_count: u32,

    /// Always scan, even for address-shaped identifiers.
    pub force_scan: bool,

    /// Scan indefinitely (until cancelled) instead of one window.
    pub wait: bool,

    /// Forward debug-level events to the log.
    pub verbose_logging: bool,

    /// Bytes per packet characteristic write.
    pub packet_size: usize,

    #[serde(with = "seconds")]
    pub response_timeout: Duration,

    #[serde(with = "seconds")]
    pub receipt_timeout: Duration,

    #[serde(with = "seconds")]
    pub validation_timeout: Duration,

    /// Bound for finding the bootloader after the buttonless jump.
    #[serde(with = "seconds")]
    pub reconnect_timeout: Duration,

    #[serde(with = "seconds")]
    pub retry_backoff: Duration,

    /// Name the bootloader advertises with.
    pub bootloader_name: String,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            prn: DEFAULT_PRN,
            start_delay: DEFAULT_START_DELAY,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            force_scan: false,
            wait: false,
            verbose_logging: false,
            packet_size: DEFAULT_PACKET_SIZE,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            receipt_timeout: DEFAULT_RECEIPT_TIMEOUT,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            bootloader_name: DEFAULT_BOOTLOADER_NAME.to_string(),
        }
    }
}

impl DfuConfig {
    /// Check values the engine cannot work with.
    pub fn validate(&self) -> Result<(), DfuError> {
        if self.packet_size == 0 || self.packet_size > MAX_PACKET_SIZE {
            return Err(DfuError::InvalidConfig {
                reason: format!(
                    "packetSize must be between 1 and {}, got {}",
                    MAX_PACKET_SIZE, self.packet_size
                ),
            });
        }
        let windows = [
            ("scanTimeout", self.scan_timeout),
            ("responseTimeout", self.response_timeout),
            ("receiptTimeout", self.receipt_timeout),
            ("validationTimeout", self.validation_timeout),
        ];
        if let Some((name, _)) = windows.iter().find(|(_, duration)| duration.is_zero()) {
            return Err(DfuError::InvalidConfig {
                reason: format!("{} must be greater than zero", name),
            });
        }
        Ok(())
    }

    /// Total attempts per image: the first one plus `retry_count`.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Serialize a `Duration` as float seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Errors from loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings file name stored in the app data directory.
const SETTINGS_FILENAME: &str = "dfu_settings.json";

/// Manages persistence of `DfuConfig` to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given app data directory.
    pub fn new(app_data_dir: &Path) -> Self {
        let settings_file_path = app_data_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> Result<DfuConfig, SettingsError> {
        if !self.settings_file_path.exists() {
            return Ok(DfuConfig::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(DfuConfig::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk.
    pub fn save(&self, config: &DfuConfig) -> Result<(), SettingsError> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(config)?;
        fs::write(&self.settings_file_path, contents)?;
        tracing::debug!(path = %self.settings_file_path.display(), "Saved DFU settings");

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
