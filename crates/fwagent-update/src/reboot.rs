//! Device restart after an update
//!
//! The reboot never runs on the connector thread: it is handed to a named
//! worker that sleeps for the configured delay first, which gives the
//! connector time to report the result.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::reboot::{RebootMode, reboot};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::boot::BootType;
use crate::error::FirmwareUpdateError;
use crate::installer::FW_SETENV;
use crate::process::{CommandRunner, command_line};

/// How the device restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebootPlan {
    /// Plain restart into the (possibly swapped) active partition
    Direct,
    /// Restart into the recovery system, which installs the staged package
    Recovery,
}

impl RebootPlan {
    /// Plan matching a boot layout, `None` when the layout is unknown.
    pub fn for_boot_type(boot_type: BootType) -> Option<Self> {
        match boot_type {
            BootType::Dual => Some(RebootPlan::Direct),
            BootType::Single => Some(RebootPlan::Recovery),
            BootType::Unknown => None,
        }
    }
}

/// Restart primitives
pub trait SystemRestart: Send + Sync {
    /// Flush file systems and restart.
    fn restart(&self) -> Result<(), FirmwareUpdateError>;

    /// Restart into the recovery system.
    fn restart_to_recovery(&self) -> Result<(), FirmwareUpdateError>;
}

/// [`SystemRestart`] through the kernel reboot call
pub struct KernelRestart {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl KernelRestart {
    /// Create a restart handle; `runner` sets the recovery flag.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl SystemRestart for KernelRestart {
    fn restart(&self) -> Result<(), FirmwareUpdateError> {
        nix::unistd::sync();
        reboot(RebootMode::RB_AUTOBOOT).map_err(|e| FirmwareUpdateError::Command {
            command: "reboot".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn restart_to_recovery(&self) -> Result<(), FirmwareUpdateError> {
        let args = ["boot_recovery", "yes"];
        let output = self.runner.run(FW_SETENV, &args, Some(self.timeout))?;
        if !output.success() {
            return Err(FirmwareUpdateError::Command {
                command: command_line(FW_SETENV, &args),
                reason: format!("exit status {:?}", output.status),
            });
        }
        self.restart()
    }
}

impl std::fmt::Debug for KernelRestart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRestart")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Runs the restart on a detached worker after a delay
#[derive(Clone)]
pub struct RebootScheduler {
    restart: Arc<dyn SystemRestart>,
    delay: Duration,
}

impl RebootScheduler {
    /// Create a scheduler.
    pub fn new(restart: Arc<dyn SystemRestart>, delay: Duration) -> Self {
        Self { restart, delay }
    }

    /// Restart the device according to `plan` after the configured delay.
    ///
    /// Returns the worker handle, or `None` if no worker could be started
    /// and the restart already ran on the calling thread.
    pub fn schedule(&self, plan: RebootPlan) -> Option<JoinHandle<()>> {
        info!("Rebooting in {:?} ({:?})", self.delay, plan);

        let restart = Arc::clone(&self.restart);
        let delay = self.delay;
        let spawned = std::thread::Builder::new()
            .name("fwagent-reboot".to_string())
            .spawn(move || run_restart(restart.as_ref(), plan, delay));

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Unable to start reboot thread ({}), rebooting now", e);
                run_restart(self.restart.as_ref(), plan, self.delay);
                None
            }
        }
    }
}

impl std::fmt::Debug for RebootScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebootScheduler")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

fn run_restart(restart: &dyn SystemRestart, plan: RebootPlan, delay: Duration) {
    std::thread::sleep(delay);
    let result = match plan {
        RebootPlan::Direct => restart.restart(),
        RebootPlan::Recovery => restart.restart_to_recovery(),
    };
    if let Err(e) = result {
        match plan {
            RebootPlan::Direct => error!("Error rebooting: {}", e),
            RebootPlan::Recovery => error!("Error rebooting in recovery mode: {}", e),
        }
    }
}
