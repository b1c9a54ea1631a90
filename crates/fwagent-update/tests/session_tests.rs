//! End-to-end update sessions driven through the connector callbacks

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use common::{
    FakeEngine, GatedRecovery, RecordingRecovery, RecordingRestart, ScriptedRunner, TestResult,
    blob, manifest_text, wait_until, write_fragments,
};
use fwagent_update::prelude::*;
use fwagent_update::{DUAL_BOOT_FAILURE_MARKER, RunningMode, StorageMedia};
use tempfile::TempDir;

const SWU: u32 = 0;
const MANIFEST: u32 = 1;
const REBOOT_WAIT: Duration = Duration::from_secs(5);

/// Data-phase result collected from a helper thread
type ScopedResult = Result<Result<(), DataError>, Box<dyn std::error::Error>>;

struct Device {
    download: TempDir,
    system: TempDir,
}

impl Device {
    fn new() -> std::io::Result<Self> {
        let system = TempDir::new()?;
        std::fs::write(system.path().join("mtd"), "dev:    size   erasesize  name\n")?;
        std::fs::write(system.path().join("mounts"), "/dev/root / ext4 rw 0 0\n")?;
        Ok(Self {
            download: TempDir::new()?,
            system,
        })
    }

    fn config(&self, on_the_fly: bool) -> UpdateConfig {
        UpdateConfig::builder()
            .firmware_download_path(self.download.path())
            .on_the_fly(on_the_fly)
            .firmware_version("1.0.0.0")
            .reboot_delay_secs(0)
            .command_timeout_secs(1)
            .mtd_info_path(self.system.path().join("mtd"))
            .mounts_path(self.system.path().join("mounts"))
            .build()
    }

    fn file(&self, name: &str) -> PathBuf {
        self.download.path().join(name)
    }
}

fn dual_boot_runner() -> Arc<ScriptedRunner> {
    Arc::new(ScriptedRunner::new().respond("update-firmware -a -s", CommandOutput::ok("a\n")))
}

fn staged_controller(
    device: &Device,
    runner: &Arc<ScriptedRunner>,
    boot_type: BootType,
) -> Result<(UpdateSessionController, Receiver<RebootPlan>), FirmwareUpdateError> {
    let (restart, reboots) = RecordingRestart::new();
    let controller = UpdateSessionController::builder(device.config(false))
        .command_runner(Arc::clone(runner) as Arc<dyn CommandRunner>)
        .system_restart(restart)
        .boot_type(boot_type)
        .build()?;
    Ok((controller, reboots))
}

fn streaming_controller(
    device: &Device,
    runner: &Arc<ScriptedRunner>,
    engine: &Arc<FakeEngine>,
) -> Result<(UpdateSessionController, Receiver<RebootPlan>), FirmwareUpdateError> {
    let (restart, reboots) = RecordingRestart::new();
    let controller = UpdateSessionController::builder(device.config(true))
        .command_runner(Arc::clone(runner) as Arc<dyn CommandRunner>)
        .streaming_engine(Arc::clone(engine) as Arc<dyn StreamingEngine>)
        .system_restart(restart)
        .boot_type(BootType::Dual)
        .build()?;
    Ok((controller, reboots))
}

/// Send `data` in `chunk`-sized pieces starting at offset 0.
fn send_staged(
    controller: &UpdateSessionController,
    target: u32,
    data: &[u8],
    chunk: usize,
) -> Result<(), DataError> {
    let total = data.chunks(chunk).count();
    let mut offset = 0u64;
    for (index, piece) in data.chunks(chunk).enumerate() {
        controller.data(target, offset, piece, index + 1 == total)?;
        offset += piece.len() as u64;
    }
    Ok(())
}

/// Stream `chunks` to the engine, waiting for each one to be taken before
/// sending the next.
fn send_streamed(
    controller: &UpdateSessionController,
    engine: &FakeEngine,
    chunks: &[&[u8]],
    finish: bool,
) -> Result<(), DataError> {
    let mut offset = 0u64;
    for (index, piece) in chunks.iter().enumerate() {
        let last = finish && index + 1 == chunks.len();
        controller.data(SWU, offset, piece, last)?;
        if !last {
            assert!(engine.wait_drained(), "engine did not take chunk {index}");
        }
        offset += piece.len() as u64;
    }
    Ok(())
}

#[test]
fn test_staged_dual_boot_install_and_reboot() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, reboots) = staged_controller(&device, &runner, BootType::Dual)?;
    let image = blob(10_000);

    controller.request(SWU, "image.swu", image.len() as u64)?;
    assert_eq!(controller.state(), SessionState::Requested);
    assert!(device.file("image.swu").exists());

    send_staged(&controller, SWU, &image, 4096)?;

    assert_eq!(controller.state(), SessionState::Completed);
    assert!(runner.ran(&format!(
        "update-firmware --no-reboot {}",
        device.file("image.swu").display()
    )));
    assert!(
        !device.file("image.swu").exists(),
        "dual-boot package is removed after install"
    );

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(decision.reboot_scheduled);
    assert!(!decision.system_reset);
    assert_eq!(controller.state(), SessionState::Rebooting);
    assert_eq!(reboots.recv_timeout(REBOOT_WAIT)?, RebootPlan::Direct);
    Ok(())
}

#[test]
fn test_manifest_install_on_single_boot_uses_recovery() -> TestResult {
    let device = Device::new()?;
    let fragments = TempDir::new()?;
    let image = blob(250_000);
    write_fragments(fragments.path(), "img", &image, 3)?;
    let manifest = manifest_text(
        "img",
        image.len() as u64,
        3,
        crc32fast::hash(&image),
        fragments.path(),
    );

    let runner = Arc::new(ScriptedRunner::new());
    let recovery = Arc::new(RecordingRecovery::default());
    let (restart, reboots) = RecordingRestart::new();
    let controller = UpdateSessionController::builder(device.config(false))
        .command_runner(Arc::clone(&runner) as Arc<dyn CommandRunner>)
        .recovery_writer(Arc::clone(&recovery) as Arc<dyn RecoveryWriter>)
        .system_restart(restart)
        .boot_type(BootType::Single)
        .build()?;

    controller.request(MANIFEST, "manifest.txt", manifest.len() as u64)?;
    send_staged(&controller, MANIFEST, manifest.as_bytes(), 64)?;

    assert_eq!(controller.state(), SessionState::Completed);
    assert!(!device.file("manifest.txt").exists());
    assert_eq!(std::fs::read(device.file("img.swu"))?, image);
    assert_eq!(*recovery.packages.lock(), vec![device.file("img.swu")]);
    assert!(
        !runner.ran("update-firmware --no-reboot"),
        "single-boot devices install from recovery"
    );

    let decision = controller.reset(MANIFEST, &FirmwareVersion::default());
    assert!(decision.reboot_scheduled);
    assert_eq!(reboots.recv_timeout(REBOOT_WAIT)?, RebootPlan::Recovery);
    Ok(())
}

#[test]
fn test_manifest_with_missing_fragment_fails_data_phase() -> TestResult {
    let device = Device::new()?;
    let fragments = TempDir::new()?;
    let image = blob(50_000);
    write_fragments(fragments.path(), "img", &image, 2)?;
    std::fs::remove_file(fragments.path().join("img1.zip"))?;
    let manifest = manifest_text("img", 50_000, 2, crc32fast::hash(&image), fragments.path());

    let runner = dual_boot_runner();
    let (controller, reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    controller.request(MANIFEST, "manifest.txt", manifest.len() as u64)?;
    let result = send_staged(&controller, MANIFEST, manifest.as_bytes(), 4096);

    assert_eq!(result, Err(DataError::InvalidData));
    assert_eq!(controller.state(), SessionState::Completed);
    assert_eq!(controller.outcome().map(|o| o.success), Some(false));
    assert!(!device.file("manifest.txt").exists());
    assert!(!device.file("img.swu").exists());

    let decision = controller.reset(MANIFEST, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_request_larger_than_free_space() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    let result = controller.request(SWU, "image.swu", u64::MAX);

    assert_eq!(result, Err(RequestError::DownloadInvalidSize));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!device.file("image.swu").exists());
    Ok(())
}

#[test]
fn test_installer_failure_marker_blocks_reboot() -> TestResult {
    let device = Device::new()?;
    let runner = Arc::new(ScriptedRunner::new().respond(
        "update-firmware --no-reboot",
        CommandOutput::ok(format!("Installing...\n{DUAL_BOOT_FAILURE_MARKER}\n")),
    ));
    let (controller, reboots) = staged_controller(&device, &runner, BootType::Dual)?;
    let image = blob(3000);

    controller.request(SWU, "image.swu", image.len() as u64)?;
    let result = send_staged(&controller, SWU, &image, 1000);

    assert_eq!(result, Err(DataError::InvalidData));
    assert!(!device.file("image.swu").exists());
    assert_eq!(controller.state(), SessionState::Completed);

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_unknown_boot_type_fails_install() -> TestResult {
    let device = Device::new()?;
    let runner = Arc::new(ScriptedRunner::new());
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Unknown)?;

    controller.request(SWU, "image.swu", 4)?;
    let result = controller.data(SWU, 0, b"data", true);

    assert_eq!(result, Err(DataError::InvalidData));
    assert_eq!(controller.outcome().map(|o| o.success), Some(false));
    Ok(())
}

#[test]
fn test_offset_gap_is_rejected() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    controller.request(SWU, "image.swu", 100)?;
    controller.data(SWU, 0, &[1; 10], false)?;

    assert_eq!(
        controller.data(SWU, 20, &[2; 10], false),
        Err(DataError::InvalidOffset)
    );
    assert_eq!(controller.state(), SessionState::Receiving);
    controller.data(SWU, 10, &[2; 10], false)?;
    Ok(())
}

#[test]
fn test_second_request_while_busy() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    controller.request(SWU, "image.swu", 100)?;

    assert_eq!(
        controller.request(MANIFEST, "manifest.txt", 10),
        Err(RequestError::DownloadNotAllowed)
    );
    assert_eq!(controller.state(), SessionState::Requested);
    Ok(())
}

#[test]
fn test_request_rejects_path_in_file_name() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    assert_eq!(
        controller.request(SWU, "../../etc/evil.swu", 10),
        Err(RequestError::DownloadDenied)
    );
    assert_eq!(
        controller.request(7, "image.swu", 10),
        Err(RequestError::EncounteredError)
    );
    assert_eq!(controller.state(), SessionState::Idle);
    Ok(())
}

#[test]
fn test_data_without_request() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    assert_eq!(
        controller.data(SWU, 0, b"orphan", true),
        Err(DataError::InvalidData)
    );
    Ok(())
}

#[test]
fn test_cancel_staged_download_removes_file() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    controller.request(SWU, "image.swu", 100)?;
    controller.data(SWU, 0, &[7; 50], false)?;

    controller.cancel(MANIFEST, CancelReason::UserAbort);
    assert_eq!(controller.state(), SessionState::Receiving, "other target ignored");

    controller.cancel(SWU, CancelReason::UserAbort);
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!device.file("image.swu").exists());

    controller.request(SWU, "image.swu", 100)?;
    Ok(())
}

#[test]
fn test_cancel_while_installing_withdraws_recovery() -> TestResult {
    let device = Device::new()?;
    let runner = Arc::new(ScriptedRunner::new());
    let (recovery, entered, release) = GatedRecovery::new();
    let (restart, reboots) = RecordingRestart::new();
    let controller = UpdateSessionController::builder(device.config(false))
        .command_runner(Arc::clone(&runner) as Arc<dyn CommandRunner>)
        .recovery_writer(Arc::clone(&recovery) as Arc<dyn RecoveryWriter>)
        .system_restart(restart)
        .boot_type(BootType::Single)
        .build()?;
    let image = blob(8192);

    controller.request(SWU, "image.swu", image.len() as u64)?;

    let result = std::thread::scope(|scope| -> ScopedResult {
        let sender = scope.spawn(|| send_staged(&controller, SWU, &image, 4096));

        entered.recv_timeout(REBOOT_WAIT)?;
        assert_eq!(controller.state(), SessionState::Installing);
        controller.cancel(SWU, CancelReason::UserAbort);
        release.send(())?;

        Ok(sender.join().map_err(|_panic| "data thread panicked")?)
    })?;

    assert_eq!(result, Err(DataError::InvalidData));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.outcome().is_none());
    assert!(!device.file("image.swu").exists(), "cancelled package is removed");
    assert_eq!(recovery.inner.cleared.load(Ordering::SeqCst), 1);
    assert!(recovery.inner.packages.lock().is_empty());

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_reset_without_update_does_nothing() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    let decision = controller.reset(SWU, &FirmwareVersion::default());

    assert_eq!(decision, ResetDecision::default());
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_reset_for_other_target_does_not_reboot() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    controller.request(SWU, "image.swu", 4)?;
    controller.data(SWU, 0, b"data", true)?;

    let decision = controller.reset(MANIFEST, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_streamed_install_swaps_and_reboots() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let engine = FakeEngine::new(EndStatus::Success);
    let (controller, reboots) = streaming_controller(&device, &runner, &engine)?;
    let image = blob(10 * 1024);
    let chunks: Vec<&[u8]> = image.chunks(1024).collect();

    controller.request(SWU, "image.swu", image.len() as u64)?;
    assert!(
        !device.file("image.swu").exists(),
        "streamed images never touch the download directory"
    );
    assert_eq!(
        engine.requests.lock().first().copied(),
        Some(StreamRequest {
            storage_media: StorageMedia::Mmc,
            running_mode: RunningMode::Secondary,
        })
    );

    send_streamed(&controller, &engine, &chunks, true)?;
    engine.join();

    assert_eq!(engine.chunk_count(), 10);
    assert_eq!(*engine.received.lock(), image);
    assert_eq!(controller.state(), SessionState::Completed);
    assert_eq!(
        controller.outcome().map(|o| (o.mode, o.success)),
        Some((DeliveryMode::Streaming, true))
    );

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(decision.reboot_scheduled);
    assert!(runner.ran("update-firmware --swap-active-system --no-reboot"));
    assert_eq!(reboots.recv_timeout(REBOOT_WAIT)?, RebootPlan::Direct);
    Ok(())
}

#[test]
fn test_streaming_cancel_midway_then_new_request() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let engine = FakeEngine::new(EndStatus::Success);
    let (controller, _reboots) = streaming_controller(&device, &runner, &engine)?;
    let image = blob(10 * 512);
    let chunks: Vec<&[u8]> = image.chunks(512).collect();

    controller.request(SWU, "image.swu", image.len() as u64)?;
    send_streamed(&controller, &engine, chunks.get(..3).unwrap_or_default(), false)?;

    controller.cancel(SWU, CancelReason::UserAbort);
    engine.join();

    assert_eq!(engine.chunk_count(), 3);
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.outcome().is_none());
    assert!(engine.session().is_some_and(|s| s.is_aborted()));

    controller.request(SWU, "image.swu", image.len() as u64)?;
    assert_eq!(controller.state(), SessionState::Requested);
    send_streamed(&controller, &engine, &chunks, true)?;
    engine.join();
    assert_eq!(*engine.received.lock(), image);
    Ok(())
}

#[test]
fn test_streaming_cancel_while_finalizing() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let engine = FakeEngine::new(EndStatus::Success);
    let (controller, reboots) = streaming_controller(&device, &runner, &engine)?;
    let image = blob(4 * 512);
    let chunks: Vec<&[u8]> = image.chunks(512).collect();

    let release = engine.hold_completion();
    controller.request(SWU, "image.swu", image.len() as u64)?;

    let result = std::thread::scope(|scope| -> ScopedResult {
        let sender = scope.spawn(|| send_streamed(&controller, &engine, &chunks, true));

        assert!(wait_until(REBOOT_WAIT, || {
            controller.state() == SessionState::Finalizing && engine.chunk_count() == 4
        }));
        // Cancel blocks until the engine winds down.
        let canceller = scope.spawn(|| controller.cancel(SWU, CancelReason::UserAbort));
        assert!(wait_until(REBOOT_WAIT, || controller.state() == SessionState::Cancelled));
        release.send(())?;

        canceller.join().map_err(|_panic| "cancel thread panicked")?;
        Ok(sender.join().map_err(|_panic| "data thread panicked")?)
    })?;
    engine.join();

    assert_eq!(result, Err(DataError::InvalidData));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.outcome().is_none());
    assert!(engine.session().is_some_and(|s| s.is_aborted() && !s.succeeded()));

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert!(!runner.ran("update-firmware --swap-active-system"));
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_streaming_engine_failure() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let engine = FakeEngine::new(EndStatus::Failure);
    let (controller, reboots) = streaming_controller(&device, &runner, &engine)?;
    let image = blob(2048);
    let chunks: Vec<&[u8]> = image.chunks(1024).collect();

    controller.request(SWU, "image.swu", image.len() as u64)?;
    let result = send_streamed(&controller, &engine, &chunks, true);
    engine.join();

    assert_eq!(result, Err(DataError::InvalidData));
    assert_eq!(controller.outcome().map(|o| o.success), Some(false));

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert!(!runner.ran("update-firmware --swap-active-system"));
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_failed_swap_skips_reboot() -> TestResult {
    let device = Device::new()?;
    let runner = Arc::new(
        ScriptedRunner::new()
            .respond("update-firmware -a -s", CommandOutput::ok("b"))
            .fail("update-firmware --swap-active-system", "no bootloader"),
    );
    let engine = FakeEngine::new(EndStatus::Success);
    let (controller, reboots) = streaming_controller(&device, &runner, &engine)?;

    controller.request(SWU, "image.swu", 4)?;
    controller.data(SWU, 0, b"data", true)?;
    engine.join();
    assert_eq!(
        engine.requests.lock().first().map(|r| r.running_mode),
        Some(RunningMode::Primary)
    );

    let decision = controller.reset(SWU, &FirmwareVersion::default());
    assert!(!decision.reboot_scheduled);
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(reboots.recv_timeout(Duration::from_millis(100)).is_err());
    Ok(())
}

#[test]
fn test_manifest_target_never_streams() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let engine = FakeEngine::new(EndStatus::Success);
    let (controller, _reboots) = streaming_controller(&device, &runner, &engine)?;

    controller.request(MANIFEST, "manifest.txt", 16)?;

    assert!(device.file("manifest.txt").exists());
    assert!(engine.requests.lock().is_empty());
    controller.cancel(MANIFEST, CancelReason::DeviceError);
    assert!(!device.file("manifest.txt").exists());
    Ok(())
}

#[test]
fn test_rebooting_controller_rejects_requests() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    controller.request(SWU, "image.swu", 4)?;
    controller.data(SWU, 0, b"data", true)?;
    assert!(controller.reset(SWU, &FirmwareVersion::default()).reboot_scheduled);
    assert_eq!(reboots.recv_timeout(REBOOT_WAIT)?, RebootPlan::Direct);

    assert_eq!(
        controller.request(SWU, "image.swu", 4),
        Err(RequestError::DownloadNotAllowed)
    );
    Ok(())
}

#[test]
fn test_targets_follow_configured_version() -> TestResult {
    let device = Device::new()?;
    let runner = dual_boot_runner();
    let (controller, _reboots) = staged_controller(&device, &runner, BootType::Dual)?;

    let targets = controller.targets().unwrap_or_default();
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t.version.to_string() == "1.0.0.0"));
    Ok(())
}
