//! Configuration read by the firmware update core
//!
//! Only the handful of agent settings the update path consumes live here;
//! the rest of the agent configuration belongs to the host process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::FirmwareUpdateError;

/// Firmware update configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Directory where firmware files are downloaded and assembled
    pub firmware_download_path: PathBuf,

    /// Install `.swu` packages while they stream in (dual-boot devices only)
    pub on_the_fly: bool,

    /// Version reported to the remote manager for every firmware target
    pub firmware_version: String,

    /// Delay before the reboot thread restarts the device
    pub reboot_delay_secs: u64,

    /// Upper bound for short helper commands (boot environment, active system)
    pub command_timeout_secs: u64,

    /// MTD partition table, used to detect the storage media
    pub mtd_info_path: PathBuf,

    /// Mount table, used to find a mounted inactive partition
    pub mounts_path: PathBuf,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            firmware_download_path: PathBuf::from("/mnt/update"),
            on_the_fly: false,
            firmware_version: "0.0.0.0".to_string(),
            reboot_delay_secs: 1,
            command_timeout_secs: 2,
            mtd_info_path: PathBuf::from("/proc/mtd"),
            mounts_path: PathBuf::from("/proc/mounts"),
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, FirmwareUpdateError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| FirmwareUpdateError::io(path, e))?;
        let config: UpdateConfig = serde_json::from_str(&content)?;
        debug!("Loaded firmware update configuration from {}", path.display());
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), FirmwareUpdateError> {
        if self.firmware_download_path.as_os_str().is_empty() {
            return Err(FirmwareUpdateError::InvalidConfiguration(
                "firmware_download_path cannot be empty".to_string(),
            ));
        }
        if !self.firmware_download_path.is_dir() {
            return Err(FirmwareUpdateError::InvalidConfiguration(format!(
                "firmware_download_path '{}' is not an existing directory",
                self.firmware_download_path.display()
            )));
        }
        if self.command_timeout_secs == 0 {
            return Err(FirmwareUpdateError::InvalidConfiguration(
                "command_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Reboot delay as a duration.
    pub fn reboot_delay(&self) -> Duration {
        Duration::from_secs(self.reboot_delay_secs)
    }

    /// Helper command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> UpdateConfigBuilder {
        UpdateConfigBuilder::default()
    }
}

/// Builder for [`UpdateConfig`]
#[derive(Debug, Default)]
pub struct UpdateConfigBuilder {
    config: UpdateConfig,
}

impl UpdateConfigBuilder {
    /// Set the download directory.
    #[must_use]
    pub fn firmware_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.firmware_download_path = path.into();
        self
    }

    /// Enable or disable on-the-fly installs.
    #[must_use]
    pub fn on_the_fly(mut self, enabled: bool) -> Self {
        self.config.on_the_fly = enabled;
        self
    }

    /// Set the reported firmware version.
    #[must_use]
    pub fn firmware_version(mut self, version: impl Into<String>) -> Self {
        self.config.firmware_version = version.into();
        self
    }

    /// Set the reboot delay in seconds.
    #[must_use]
    pub fn reboot_delay_secs(mut self, secs: u64) -> Self {
        self.config.reboot_delay_secs = secs;
        self
    }

    /// Set the helper command timeout in seconds.
    #[must_use]
    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.config.command_timeout_secs = secs;
        self
    }

    /// Set the MTD partition table location.
    #[must_use]
    pub fn mtd_info_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mtd_info_path = path.into();
        self
    }

    /// Set the mount table location.
    #[must_use]
    pub fn mounts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mounts_path = path.into();
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> UpdateConfig {
        self.config
    }
}
