//! Package install dispatch
//!
//! Dual-boot devices install into the inactive partition with
//! `update-firmware --no-reboot`. Single-boot devices hand the package to
//! the recovery system through a [`RecoveryWriter`] and install on the next
//! (recovery) boot.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::boot::{BootSystemClassifier, BootType};
use crate::error::FirmwareUpdateError;
use crate::process::{CommandRunner, command_line};
use crate::target::FirmwareTarget;

/// Dual-boot installer tool
pub const UPDATE_FIRMWARE: &str = "update-firmware";

/// Line printed by the dual-boot installer when the install failed.
///
/// The installer's exit status is not reliable, so its output is scanned.
pub const DUAL_BOOT_FAILURE_MARKER: &str = "There was an error performing the update";

/// Bootloader environment writer
pub const FW_SETENV: &str = "fw_setenv";

/// Stages a package for the recovery system on single-boot devices
pub trait RecoveryWriter: Send + Sync {
    /// Arrange for the recovery system to install `package` on next boot.
    fn write_recovery(&self, package: &Path) -> Result<(), FirmwareUpdateError>;

    /// Withdraw a pending recovery install.
    fn clear_recovery(&self) -> Result<(), FirmwareUpdateError>;
}

/// [`RecoveryWriter`] that records the request in the bootloader environment
pub struct FwSetenvRecovery {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl FwSetenvRecovery {
    /// Create a writer that runs `fw_setenv` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    // Without a value, fw_setenv deletes the variable.
    fn setenv(&self, args: &[&str]) -> Result<(), FirmwareUpdateError> {
        let output = self.runner.run(FW_SETENV, args, Some(self.timeout))?;
        if !output.success() {
            return Err(FirmwareUpdateError::Command {
                command: command_line(FW_SETENV, args),
                reason: format!("exit status {:?}", output.status),
            });
        }
        Ok(())
    }
}

impl RecoveryWriter for FwSetenvRecovery {
    fn write_recovery(&self, package: &Path) -> Result<(), FirmwareUpdateError> {
        let command = format!("--update_package={}", package.display());
        self.setenv(&["recovery_command", &command])?;
        self.setenv(&["boot_recovery", "yes"])?;
        debug!("Recovery install of '{}' requested", package.display());
        Ok(())
    }

    fn clear_recovery(&self) -> Result<(), FirmwareUpdateError> {
        self.setenv(&["boot_recovery"])?;
        self.setenv(&["recovery_command"])?;
        debug!("Recovery install request withdrawn");
        Ok(())
    }
}

impl std::fmt::Debug for FwSetenvRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FwSetenvRecovery")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Routes a finished package to the installer matching the boot layout
pub struct InstallDispatcher {
    runner: Arc<dyn CommandRunner>,
    classifier: Arc<BootSystemClassifier>,
    recovery: Option<Arc<dyn RecoveryWriter>>,
}

impl InstallDispatcher {
    /// Create a dispatcher. Without a recovery writer, single-boot installs fail.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        classifier: Arc<BootSystemClassifier>,
        recovery: Option<Arc<dyn RecoveryWriter>>,
    ) -> Self {
        Self {
            runner,
            classifier,
            recovery,
        }
    }

    /// Install `package` received for `target`.
    pub fn install(
        &self,
        package: &Path,
        target: FirmwareTarget,
    ) -> Result<BootType, FirmwareUpdateError> {
        let boot_type = self.classifier.classify();
        info!(
            "Installing '{}' for target {} ({} boot)",
            package.display(),
            target,
            boot_type
        );

        match boot_type {
            BootType::Dual => self.install_dual_boot(package, target)?,
            BootType::Single => self.install_recovery(package, target)?,
            BootType::Unknown => {
                error!(
                    "Cannot install '{}': boot system type unknown",
                    package.display()
                );
                return Err(FirmwareUpdateError::BootTypeUnknown);
            }
        }

        Ok(boot_type)
    }

    /// Undo the recovery request of a single-boot install that was cancelled.
    pub fn withdraw_recovery(&self) -> Result<(), FirmwareUpdateError> {
        match &self.recovery {
            Some(recovery) => recovery.clear_recovery(),
            None => Ok(()),
        }
    }

    fn install_dual_boot(
        &self,
        package: &Path,
        target: FirmwareTarget,
    ) -> Result<(), FirmwareUpdateError> {
        let path = package.to_string_lossy();
        let args = ["--no-reboot", path.as_ref()];
        debug!("Starting update with path '{}'", package.display());

        let output = self.runner.run(UPDATE_FIRMWARE, &args, None).map_err(|e| {
            error!(
                "Couldn't execute dualboot installation cmd '{}': {}",
                command_line(UPDATE_FIRMWARE, &args),
                e
            );
            FirmwareUpdateError::InstallFailed(e.to_string())
        })?;

        let mut failed = false;
        for line in output.lines() {
            debug!("swupdate: {}", line);
            if line.contains(DUAL_BOOT_FAILURE_MARKER) {
                failed = true;
            }
        }

        if failed {
            error!(
                "Error updating firmware using package '{}' for target {}",
                package.display(),
                target
            );
            return Err(FirmwareUpdateError::InstallFailed(format!(
                "installer reported an error for '{}'",
                package.display()
            )));
        }

        Ok(())
    }

    fn install_recovery(
        &self,
        package: &Path,
        target: FirmwareTarget,
    ) -> Result<(), FirmwareUpdateError> {
        let recovery = self.recovery.as_ref().ok_or_else(|| {
            FirmwareUpdateError::InstallFailed(
                "single-boot device without recovery support".to_string(),
            )
        })?;

        recovery.write_recovery(package).map_err(|e| {
            error!(
                "Error updating firmware using package '{}' for target {}: {}",
                package.display(),
                target,
                e
            );
            FirmwareUpdateError::InstallFailed(e.to_string())
        })
    }
}

impl std::fmt::Debug for InstallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallDispatcher")
            .field("classifier", &self.classifier)
            .field("recovery", &self.recovery.is_some())
            .finish_non_exhaustive()
    }
}
