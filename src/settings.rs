//! Session settings with persistence.
//!
//! This module provides:
//! - `SessionSettings`: link rates, port filters and protocol timing
//! - Persistence to a JSON file in a settings directory
//!
//! Missing fields fall back to their defaults, so a settings file only needs
//! to list what it overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::PortFilter;
use crate::dfu::config::{
    APPLICATION_BAUD_RATE, BOOTLOADER_BAUD_RATE, COMMAND_TIMEOUT_MS, RESPONSE_TIMEOUT_MS,
};

/// Tunables for a [`DeviceSession`](crate::session::DeviceSession).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Baud rate for the application's text console.
    pub app_baud_rate: u32,

    /// Baud rate used when probing for the bootloader.
    pub bootloader_baud_rate: u32,

    /// Port filters applied when opening the channel. The bootloader
    /// filter is appended for bootloader activation.
    pub port_filters: Vec<PortFilter>,

    /// How long to wait for a DFU response frame.
    pub response_timeout_ms: u64,

    /// How long to collect output after a text command.
    pub command_timeout_ms: u64,

    /// Silence tolerated during a block transfer before giving up.
    pub xmodem_idle_timeout_ms: u64,

    /// Delay between 64-byte chunks of a text-mode file upload.
    pub upload_chunk_delay_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            app_baud_rate: APPLICATION_BAUD_RATE,
            bootloader_baud_rate: BOOTLOADER_BAUD_RATE,
            port_filters: Vec::new(),
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            xmodem_idle_timeout_ms: 10_000,
            upload_chunk_delay_ms: 30,
        }
    }
}

impl SessionSettings {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn xmodem_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.xmodem_idle_timeout_ms)
    }

    pub fn upload_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.upload_chunk_delay_ms)
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in the settings directory.
const SETTINGS_FILENAME: &str = "session_settings.json";

/// Manages persistence of session settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given directory.
    pub fn new(settings_dir: &Path) -> Self {
        let settings_file_path = settings_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if file doesn't exist.
    pub fn load(&self) -> Result<SessionSettings, String> {
        if !self.settings_file_path.exists() {
            return Ok(SessionSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)
            .map_err(|e| format!("Failed to read settings file: {}", e))?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(SessionSettings::default());
        }

        serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse settings JSON: {}", e))
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &SessionSettings) -> Result<(), String> {
        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let contents = serde_json::to_string_pretty(settings)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        fs::write(&self.settings_file_path, contents)
            .map_err(|e| format!("Failed to write settings file: {}", e))?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
