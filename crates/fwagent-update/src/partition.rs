//! A/B partition handling for streaming updates
//!
//! A streaming install writes straight into the inactive system partition,
//! so before the engine starts the agent finds out which partition is
//! running, picks the other one, and makes sure it is not mounted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::error::FirmwareUpdateError;
use crate::installer::UPDATE_FIRMWARE;
use crate::process::{CommandRunner, command_line};
use crate::streaming::StreamRequest;

/// System partition identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Partition A (primary)
    A,
    /// Partition B (secondary)
    B,
}

impl Partition {
    /// Get the other partition
    pub fn other(self) -> Self {
        match self {
            Partition::A => Partition::B,
            Partition::B => Partition::A,
        }
    }

    /// Parse the `update-firmware -a -s` answer (`a` or `b`).
    pub fn from_active_system(response: &str) -> Option<Self> {
        match response.trim() {
            "a" => Some(Partition::A),
            "b" => Some(Partition::B),
            _ => None,
        }
    }

    /// Where the partition is mounted when it is not running.
    pub fn mount_point(self) -> &'static str {
        match self {
            Partition::A => "/mnt/linux_a",
            Partition::B => "/mnt/linux_b",
        }
    }

    /// Running mode the streaming engine uses to write this partition.
    pub fn running_mode(self) -> RunningMode {
        match self {
            Partition::A => RunningMode::Primary,
            Partition::B => RunningMode::Secondary,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Partition::A => write!(f, "A"),
            Partition::B => write!(f, "B"),
        }
    }
}

/// Partition set selected for a streaming install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    /// Write partition A
    Primary,
    /// Write partition B
    Secondary,
}

impl RunningMode {
    /// Name passed to the streaming engine.
    pub fn as_str(self) -> &'static str {
        match self {
            RunningMode::Primary => "primary",
            RunningMode::Secondary => "secondary",
        }
    }
}

impl std::fmt::Display for RunningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flash technology holding the system partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMedia {
    /// Raw NAND through MTD
    Mtd,
    /// eMMC
    Mmc,
}

impl StorageMedia {
    /// Detect the media from the MTD partition table at `mtd_info`.
    ///
    /// Any mention of `mtd` means raw NAND; a missing or empty table means eMMC.
    pub fn detect(mtd_info: &Path) -> Self {
        match std::fs::read_to_string(mtd_info) {
            Ok(content) if content.contains("mtd") => StorageMedia::Mtd,
            _ => StorageMedia::Mmc,
        }
    }

    /// Software set name passed to the streaming engine.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageMedia::Mtd => "mtd",
            StorageMedia::Mmc => "mmc",
        }
    }
}

impl std::fmt::Display for StorageMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check whether `dir` is a mount point according to the mount table.
///
/// If the table cannot be read, an existing directory counts as mounted.
pub fn is_mount_point(mounts: &Path, dir: &str) -> bool {
    match std::fs::read_to_string(mounts) {
        Ok(table) => table
            .lines()
            .filter_map(|entry| entry.split_whitespace().nth(1))
            .any(|mount_dir| mount_dir == dir),
        Err(e) => {
            error!("Unable to check mount point {}: {}", dir, e);
            Path::new(dir).is_dir()
        }
    }
}

/// Stream preparation and the post-stream partition swap
pub struct StreamPreparation {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    mtd_info_path: PathBuf,
    mounts_path: PathBuf,
}

impl StreamPreparation {
    /// Create from the agent configuration.
    pub fn new(runner: Arc<dyn CommandRunner>, config: &UpdateConfig) -> Self {
        Self {
            runner,
            timeout: config.command_timeout(),
            mtd_info_path: config.mtd_info_path.clone(),
            mounts_path: config.mounts_path.clone(),
        }
    }

    /// Ask the installer tooling which partition is running.
    pub fn active_partition(&self) -> Result<Partition, FirmwareUpdateError> {
        let args = ["-a", "-s"];
        let output = self
            .runner
            .run(UPDATE_FIRMWARE, &args, Some(self.timeout))?;

        if !output.success() {
            error!("Error getting active system: {}", output.stdout.trim());
            return Err(FirmwareUpdateError::Command {
                command: command_line(UPDATE_FIRMWARE, &args),
                reason: format!("exit status {:?}", output.status),
            });
        }

        let active = Partition::from_active_system(&output.stdout).ok_or_else(|| {
            FirmwareUpdateError::StreamingFailed(format!(
                "unexpected active system '{}'",
                output.stdout.trim()
            ))
        })?;
        debug!("Active system detected: '{}'", active);
        Ok(active)
    }

    /// Select and free the inactive partition, returning the engine request.
    pub fn prepare(&self) -> Result<StreamRequest, FirmwareUpdateError> {
        let target = self.active_partition()?.other();
        let storage_media = StorageMedia::detect(&self.mtd_info_path);
        debug!("Is a {} device", storage_media);

        let mount_point = target.mount_point();
        if is_mount_point(&self.mounts_path, mount_point) {
            self.unmount(mount_point);
        }

        let request = StreamRequest {
            storage_media,
            running_mode: target.running_mode(),
        };
        info!("Selected {} partition to update", request.running_mode);
        Ok(request)
    }

    /// Make the freshly written partition the active one, without rebooting.
    pub fn swap_active_system(&self) -> Result<(), FirmwareUpdateError> {
        let args = ["--swap-active-system", "--no-reboot"];
        let output = self
            .runner
            .run(UPDATE_FIRMWARE, &args, Some(self.timeout))
            .inspect_err(|e| error!("Error swapping active system: {}", e))?;

        if !output.success() {
            error!("Error swapping active system: {}", output.stdout.trim());
            return Err(FirmwareUpdateError::Command {
                command: command_line(UPDATE_FIRMWARE, &args),
                reason: format!("exit status {:?}", output.status),
            });
        }
        Ok(())
    }

    // A failed unmount is expected on retries, the partition is already free.
    fn unmount(&self, mount_point: &str) {
        match self.runner.run("umount", &[mount_point], Some(self.timeout)) {
            Ok(output) if output.success() => debug!("Unmounted {}", mount_point),
            Ok(output) => debug!("umount {} exited with {:?}", mount_point, output.status),
            Err(e) => warn!("Unable to unmount {}: {}", mount_point, e),
        }
    }
}

impl std::fmt::Debug for StreamPreparation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPreparation")
            .field("timeout", &self.timeout)
            .field("mtd_info_path", &self.mtd_info_path)
            .field("mounts_path", &self.mounts_path)
            .finish_non_exhaustive()
    }
}
