//! Update session controller
//!
//! [`UpdateSessionController`] implements [`FirmwareCallbacks`] for the
//! connector. One update runs at a time and walks through
//! [`SessionState`]:
//!
//! ```text
//! Idle -> Requested -> Receiving -> Finalizing -> Installing -> Completed
//!      -> ResetDecision -> Rebooting
//! ```
//!
//! `cancel` moves Requested, Receiving, Finalizing or Installing to
//! `Cancelled`; whichever thread owns the remaining resources releases them
//! and returns the controller to `Idle`.
//!
//! The state mutex is never held while waiting on the streaming engine,
//! assembling a package or running an installer.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::assembler;
use crate::boot::{BootSystemClassifier, BootType};
use crate::config::UpdateConfig;
use crate::error::FirmwareUpdateError;
use crate::installer::{FwSetenvRecovery, InstallDispatcher, RecoveryWriter};
use crate::partition::StreamPreparation;
use crate::process::{CommandRunner, SystemCommandRunner};
use crate::reboot::{KernelRestart, RebootPlan, RebootScheduler, SystemRestart};
use crate::space;
use crate::streaming::{NoPostUpdate, PostUpdateAction, StreamSession, StreamingEngine};
use crate::target::{
    CancelReason, DataError, FirmwareCallbacks, FirmwareTarget, FirmwareVersion, RequestError,
    ResetDecision, TargetDescriptor, firmware_targets,
};

/// Lifecycle of an update session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No update in progress
    Idle,
    /// Download accepted, no data yet
    Requested,
    /// Data chunks arriving
    Receiving,
    /// Last chunk received; assembling, or waiting for the streaming engine
    Finalizing,
    /// Installer running
    Installing,
    /// Data phase over, waiting for `reset`
    Completed,
    /// Deciding whether to reboot
    ResetDecision,
    /// Reboot scheduled
    Rebooting,
    /// Cancel requested, resources being released
    Cancelled,
}

/// How the image reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Written to a file, installed afterwards
    Staged,
    /// Installed while it streamed in
    Streaming,
}

/// Result of the data phase, consumed by `reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    /// Target that was updated
    pub target: FirmwareTarget,
    /// Delivery mode
    pub mode: DeliveryMode,
    /// Whether the install succeeded
    pub success: bool,
}

enum Delivery {
    Staged { path: PathBuf, file: Option<File> },
    Streaming { session: Arc<StreamSession> },
}

struct ActiveUpdate {
    target: FirmwareTarget,
    received: u64,
    delivery: Delivery,
}

struct ControllerState {
    state: SessionState,
    generation: u64,
    active: Option<ActiveUpdate>,
    outcome: Option<UpdateOutcome>,
}

impl ControllerState {
    fn owns(&self, generation: u64) -> bool {
        self.generation == generation && self.state != SessionState::Cancelled
    }

    fn release(&mut self) {
        self.state = SessionState::Idle;
        self.active = None;
    }
}

enum ChunkStep {
    Stream(Arc<StreamSession>),
    Continue,
    Finished(PathBuf),
    Failed(PathBuf, FirmwareUpdateError),
}

/// Firmware update session controller
pub struct UpdateSessionController {
    config: UpdateConfig,
    classifier: Arc<BootSystemClassifier>,
    dispatcher: InstallDispatcher,
    preparation: StreamPreparation,
    engine: Option<Arc<dyn StreamingEngine>>,
    post_update: Arc<dyn PostUpdateAction>,
    scheduler: RebootScheduler,
    inner: Mutex<ControllerState>,
}

impl UpdateSessionController {
    /// Create a controller builder.
    #[must_use]
    pub fn builder(config: UpdateConfig) -> UpdateSessionControllerBuilder {
        UpdateSessionControllerBuilder::new(config)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Outcome of the last data phase, if `reset` has not consumed it yet.
    pub fn outcome(&self) -> Option<UpdateOutcome> {
        self.inner.lock().outcome
    }

    /// Target table to register with the connector, `None` when the
    /// configured firmware version is invalid.
    pub fn targets(&self) -> Option<Vec<TargetDescriptor>> {
        firmware_targets(&self.config.firmware_version)
    }

    /// Boot layout of the device.
    pub fn boot_type(&self) -> BootType {
        self.classifier.classify()
    }

    fn streams(&self, target: FirmwareTarget) -> bool {
        self.config.on_the_fly
            && self.engine.is_some()
            && target != FirmwareTarget::Manifest
            && self.classifier.classify() == BootType::Dual
    }

    fn open_delivery(
        &self,
        target: FirmwareTarget,
        filename: &str,
        total_size: u64,
    ) -> Result<Delivery, FirmwareUpdateError> {
        if let Some(engine) = self.engine.as_ref().filter(|_| self.streams(target)) {
            debug!("Firmware download streaming requested (target {})", target);
            let request = self.preparation.prepare()?;
            let session = Arc::new(StreamSession::new(Arc::clone(&self.post_update)));
            engine.start(request, Arc::clone(&session))?;
            return Ok(Delivery::Streaming { session });
        }

        let download_dir = &self.config.firmware_download_path;
        space::ensure_available(download_dir, total_size)?;

        let path = download_dir.join(filename);
        let file = File::create(&path).map_err(|e| {
            error!("Unable to create '{}' file (target {})", filename, target);
            FirmwareUpdateError::io(&path, e)
        })?;
        Ok(Delivery::Staged {
            path,
            file: Some(file),
        })
    }

    fn push_streamed(
        &self,
        session: Arc<StreamSession>,
        generation: u64,
        target: FirmwareTarget,
        data: &[u8],
        last_chunk: bool,
    ) -> Result<(), DataError> {
        let result = session.push_chunk(data, last_chunk);

        if !last_chunk {
            return result.map_err(|e| {
                error!("Streaming chunk rejected: {}", e);
                let mut inner = self.inner.lock();
                if inner.owns(generation) {
                    inner.release();
                }
                e.data_error()
            });
        }

        let outcome = UpdateOutcome {
            target,
            mode: DeliveryMode::Streaming,
            success: result.is_ok() && session.succeeded(),
        };
        drop(session);

        if !self.conclude(generation, outcome) {
            return Err(DataError::InvalidData);
        }
        result.map_err(|e| e.data_error())
    }

    fn finish_staged(
        &self,
        path: PathBuf,
        target: FirmwareTarget,
        generation: u64,
    ) -> Result<(), DataError> {
        info!("Starting firmware update process (target {})", target);

        let package = match target {
            FirmwareTarget::Manifest => self.assemble_manifest(&path),
            FirmwareTarget::Swu => Ok(path),
        };
        let package = match package {
            Ok(package) => package,
            Err(e) => {
                error!("Error generating firmware package (target {}): {}", target, e);
                self.conclude(generation, staged_outcome(target, false));
                return Err(e.data_error());
            }
        };

        {
            let mut inner = self.inner.lock();
            if !inner.owns(generation) {
                drop(inner);
                remove_file(&package);
                self.conclude(generation, staged_outcome(target, false));
                return Err(DataError::InvalidData);
            }
            inner.state = SessionState::Installing;
        }

        let result = self.dispatcher.install(&package, target);
        match &result {
            Ok(BootType::Single) => {
                debug!("Keeping '{}' for the recovery installer", package.display());
            }
            Ok(_) | Err(_) => remove_file(&package),
        }

        if !self.conclude(generation, staged_outcome(target, result.is_ok())) {
            if matches!(result, Ok(BootType::Single)) {
                info!("Withdrawing recovery install of '{}'", package.display());
                if let Err(e) = self.dispatcher.withdraw_recovery() {
                    error!("Unable to withdraw recovery install: {}", e);
                }
                remove_file(&package);
            }
            return Err(DataError::InvalidData);
        }
        result.map(|_| ()).map_err(|e| e.data_error())
    }

    fn assemble_manifest(&self, manifest_path: &Path) -> Result<PathBuf, FirmwareUpdateError> {
        let result =
            assembler::assemble_from_manifest(manifest_path, &self.config.firmware_download_path);
        remove_file(manifest_path);
        result
    }

    // Returns false if the session was cancelled meanwhile; the outcome is
    // then dropped.
    fn conclude(&self, generation: u64, outcome: UpdateOutcome) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        if inner.state == SessionState::Cancelled {
            info!("Update for target {} was cancelled, discarding result", outcome.target);
            inner.release();
            inner.outcome = None;
            return false;
        }

        inner.active = None;
        inner.outcome = Some(outcome);
        inner.state = SessionState::Completed;
        true
    }

    fn decide_reboot(&self, target: u32, outcome: Option<UpdateOutcome>) -> bool {
        let Some(outcome) = outcome else {
            warn!("No completed update for target '{}', not rebooting", target);
            return false;
        };
        if outcome.target.number() != target {
            warn!(
                "Reset for target '{}' but last update was for target {}",
                target, outcome.target
            );
            return false;
        }
        if !outcome.success {
            error!("Update for target {} failed, not rebooting", outcome.target);
            return false;
        }

        if outcome.mode == DeliveryMode::Streaming {
            debug!("On the fly update finished, swapping active system");
            if self.preparation.swap_active_system().is_err() {
                return false;
            }
        }

        let boot_type = self.classifier.classify();
        let Some(plan) = RebootPlan::for_boot_type(boot_type) else {
            error!("Boot system type unknown, not rebooting");
            return false;
        };

        // Detached: the worker outlives this call.
        drop(self.scheduler.schedule(plan));
        true
    }
}

impl FirmwareCallbacks for UpdateSessionController {
    fn request(&self, target: u32, filename: &str, total_size: u64) -> Result<(), RequestError> {
        info!("Firmware download requested (target '{}')", target);

        let target = parse_target(target).map_err(|e| e.request_error())?;
        if let Err(e) = validate_filename(filename) {
            error!("{}", e);
            return Err(RequestError::DownloadDenied);
        }

        let generation = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, SessionState::Idle | SessionState::Completed) {
                warn!(
                    "Firmware update already in progress ({:?}), rejecting target {}",
                    inner.state, target
                );
                return Err(RequestError::DownloadNotAllowed);
            }
            inner.generation = inner.generation.wrapping_add(1);
            inner.state = SessionState::Requested;
            inner.active = None;
            inner.outcome = None;
            inner.generation
        };

        let delivery = match self.open_delivery(target, filename, total_size) {
            Ok(delivery) => delivery,
            Err(e) => {
                error!("Firmware request for target {} failed: {}", target, e);
                let mut inner = self.inner.lock();
                if inner.generation == generation {
                    inner.release();
                }
                return Err(e.request_error());
            }
        };

        let mut inner = self.inner.lock();
        if !inner.owns(generation) {
            drop(inner);
            info!("Firmware request for target {} cancelled during setup", target);
            discard(delivery);
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.release();
            }
            return Err(RequestError::EncounteredError);
        }

        inner.active = Some(ActiveUpdate {
            target,
            received: 0,
            delivery,
        });
        Ok(())
    }

    fn data(
        &self,
        target: u32,
        offset: u64,
        data: &[u8],
        last_chunk: bool,
    ) -> Result<(), DataError> {
        debug!(
            "Received chunk: target={} offset={:#x} length={} last_chunk={}",
            target,
            offset,
            data.len(),
            last_chunk
        );

        let target = parse_target(target).map_err(|e| e.data_error())?;

        let mut inner = self.inner.lock();
        let generation = inner.generation;
        let state = inner.state;

        let Some(active) = inner.active.as_mut() else {
            warn!("Data for target {} without an accepted request", target);
            return Err(DataError::InvalidData);
        };
        if !matches!(state, SessionState::Requested | SessionState::Receiving)
            || active.target != target
        {
            warn!(
                "Unexpected data for target {} in state {:?}",
                target, state
            );
            return Err(DataError::InvalidData);
        }
        if offset != active.received {
            let e = FirmwareUpdateError::OffsetMismatch {
                expected: active.received,
                actual: offset,
            };
            error!("{}", e);
            return Err(e.data_error());
        }
        active.received = active.received.saturating_add(data.len() as u64);

        let step = match &mut active.delivery {
            Delivery::Streaming { session } => ChunkStep::Stream(Arc::clone(session)),
            Delivery::Staged { path, file } => write_chunk(path, file, data, last_chunk),
        };

        match step {
            ChunkStep::Stream(session) => {
                inner.state = if last_chunk {
                    SessionState::Finalizing
                } else {
                    SessionState::Receiving
                };
                drop(inner);
                self.push_streamed(session, generation, target, data, last_chunk)
            }
            ChunkStep::Continue => {
                inner.state = SessionState::Receiving;
                Ok(())
            }
            ChunkStep::Finished(path) => {
                inner.state = SessionState::Finalizing;
                drop(inner);
                info!("Firmware download completed for target {}", target);
                self.finish_staged(path, target, generation)
            }
            ChunkStep::Failed(path, e) => {
                error!("Error writing to firmware file: {}", e);
                inner.release();
                drop(inner);
                remove_file(&path);
                Err(e.data_error())
            }
        }
    }

    fn cancel(&self, target: u32, reason: CancelReason) {
        info!(
            "Cancel firmware update for target '{}'. Cancel reason: {}",
            target, reason
        );

        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Requested | SessionState::Receiving => {
                if let Some(active) = inner.active.as_ref()
                    && active.target.number() != target
                {
                    warn!(
                        "Cancel for target '{}' while updating target {}, ignoring",
                        target, active.target
                    );
                    return;
                }

                let generation = inner.generation;
                inner.state = SessionState::Cancelled;
                // Without an entry the request is still being set up and
                // that thread releases what it opened.
                let Some(active) = inner.active.take() else {
                    return;
                };
                drop(inner);

                discard(active.delivery);

                let mut inner = self.inner.lock();
                if inner.generation == generation {
                    inner.release();
                }
            }
            SessionState::Finalizing | SessionState::Installing => {
                inner.state = SessionState::Cancelled;
                let session = match inner.active.as_ref().map(|a| &a.delivery) {
                    Some(Delivery::Streaming { session }) => Some(Arc::clone(session)),
                    _ => None,
                };
                drop(inner);

                if let Some(session) = session {
                    let status = session.abort();
                    debug!("Streaming engine finished with {:?} after cancel", status);
                }
            }
            state => debug!("Nothing to cancel in state {:?}", state),
        }
    }

    fn reset(&self, target: u32, version: &FirmwareVersion) -> ResetDecision {
        info!("Reset requested for target '{}' (version {})", target, version);

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Completed {
                warn!("Reset in state {:?}, not rebooting", inner.state);
                return ResetDecision::default();
            }
            inner.state = SessionState::ResetDecision;
            inner.outcome.take()
        };

        let reboot_scheduled = self.decide_reboot(target, outcome);

        self.inner.lock().state = if reboot_scheduled {
            SessionState::Rebooting
        } else {
            SessionState::Idle
        };

        ResetDecision {
            system_reset: false,
            reboot_scheduled,
        }
    }
}

impl std::fmt::Debug for UpdateSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSessionController")
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .field("streaming", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

fn staged_outcome(target: FirmwareTarget, success: bool) -> UpdateOutcome {
    UpdateOutcome {
        target,
        mode: DeliveryMode::Staged,
        success,
    }
}

fn parse_target(target: u32) -> Result<FirmwareTarget, FirmwareUpdateError> {
    FirmwareTarget::try_from(target).map_err(|unknown| {
        error!("Unknown firmware target '{}'", unknown);
        FirmwareUpdateError::InvalidState(format!("unknown firmware target {unknown}"))
    })
}

fn validate_filename(filename: &str) -> Result<(), FirmwareUpdateError> {
    if filename.is_empty() || filename.contains(['/', '\\']) || filename.contains("..") {
        return Err(FirmwareUpdateError::InvalidConfiguration(format!(
            "refusing download file name '{filename}'"
        )));
    }
    Ok(())
}

fn write_chunk(path: &Path, file: &mut Option<File>, data: &[u8], last_chunk: bool) -> ChunkStep {
    let Some(handle) = file.as_mut() else {
        return ChunkStep::Failed(
            path.to_path_buf(),
            FirmwareUpdateError::InvalidState("firmware file already closed".to_string()),
        );
    };
    if let Err(e) = handle.write_all(data) {
        return ChunkStep::Failed(path.to_path_buf(), FirmwareUpdateError::io(path, e));
    }
    if !last_chunk {
        return ChunkStep::Continue;
    }

    if let Some(handle) = file.take()
        && let Err(e) = handle.sync_all()
    {
        return ChunkStep::Failed(path.to_path_buf(), FirmwareUpdateError::io(path, e));
    }
    ChunkStep::Finished(path.to_path_buf())
}

fn discard(delivery: Delivery) {
    match delivery {
        Delivery::Staged { path, file } => {
            drop(file);
            remove_file(&path);
        }
        Delivery::Streaming { session } => {
            let status = session.abort();
            debug!("Streaming engine finished with {:?} after abort", status);
        }
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!("Unable to remove '{}': {}", path.display(), e);
    }
}

enum RecoverySetting {
    Default,
    Disabled,
    Custom(Arc<dyn RecoveryWriter>),
}

/// Builder for [`UpdateSessionController`]
pub struct UpdateSessionControllerBuilder {
    config: UpdateConfig,
    runner: Option<Arc<dyn CommandRunner>>,
    engine: Option<Arc<dyn StreamingEngine>>,
    post_update: Option<Arc<dyn PostUpdateAction>>,
    recovery: RecoverySetting,
    restart: Option<Arc<dyn SystemRestart>>,
    boot_type: Option<BootType>,
}

impl UpdateSessionControllerBuilder {
    /// Start from `config`.
    #[must_use]
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            runner: None,
            engine: None,
            post_update: None,
            recovery: RecoverySetting::Default,
            restart: None,
            boot_type: None,
        }
    }

    /// Run device tooling through `runner` instead of real processes.
    #[must_use]
    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Enable streaming installs through `engine`.
    #[must_use]
    pub fn streaming_engine(mut self, engine: Arc<dyn StreamingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Action run after a successful streamed install.
    #[must_use]
    pub fn post_update(mut self, action: Arc<dyn PostUpdateAction>) -> Self {
        self.post_update = Some(action);
        self
    }

    /// Stage single-boot installs through `writer`.
    #[must_use]
    pub fn recovery_writer(mut self, writer: Arc<dyn RecoveryWriter>) -> Self {
        self.recovery = RecoverySetting::Custom(writer);
        self
    }

    /// Build without recovery support; single-boot installs then fail.
    #[must_use]
    pub fn without_recovery(mut self) -> Self {
        self.recovery = RecoverySetting::Disabled;
        self
    }

    /// Restart through `restart` instead of the kernel.
    #[must_use]
    pub fn system_restart(mut self, restart: Arc<dyn SystemRestart>) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Skip boot detection and use `boot_type`.
    #[must_use]
    pub fn boot_type(mut self, boot_type: BootType) -> Self {
        self.boot_type = Some(boot_type);
        self
    }

    /// Build the controller.
    pub fn build(self) -> Result<UpdateSessionController, FirmwareUpdateError> {
        self.config.validate()?;

        let timeout = self.config.command_timeout();
        let runner = self
            .runner
            .unwrap_or_else(|| Arc::new(SystemCommandRunner::new()));

        let classifier = Arc::new(match self.boot_type {
            Some(boot_type) => BootSystemClassifier::fixed(Arc::clone(&runner), boot_type),
            None => BootSystemClassifier::with_timeout(Arc::clone(&runner), timeout),
        });

        let recovery: Option<Arc<dyn RecoveryWriter>> = match self.recovery {
            RecoverySetting::Default => {
                Some(Arc::new(FwSetenvRecovery::new(Arc::clone(&runner), timeout)))
            }
            RecoverySetting::Disabled => None,
            RecoverySetting::Custom(writer) => Some(writer),
        };

        let restart = self
            .restart
            .unwrap_or_else(|| Arc::new(KernelRestart::new(Arc::clone(&runner), timeout)));

        Ok(UpdateSessionController {
            dispatcher: InstallDispatcher::new(
                Arc::clone(&runner),
                Arc::clone(&classifier),
                recovery,
            ),
            preparation: StreamPreparation::new(Arc::clone(&runner), &self.config),
            scheduler: RebootScheduler::new(restart, self.config.reboot_delay()),
            classifier,
            engine: self.engine,
            post_update: self.post_update.unwrap_or_else(|| Arc::new(NoPostUpdate)),
            config: self.config,
            inner: Mutex::new(ControllerState {
                state: SessionState::Idle,
                generation: 0,
                active: None,
                outcome: None,
            }),
        })
    }
}
