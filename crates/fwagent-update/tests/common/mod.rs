//! Shared fixtures for the integration tests

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fwagent_update::prelude::*;
use fwagent_update::process::command_line;
use parking_lot::Mutex;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Runner answering by command-line prefix; unmatched commands succeed
/// with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Mutex<Vec<(String, Result<CommandOutput, String>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, prefix: &str, output: CommandOutput) -> Self {
        self.responses.lock().push((prefix.to_string(), Ok(output)));
        self
    }

    pub fn fail(self, prefix: &str, reason: &str) -> Self {
        self.responses
            .lock()
            .push((prefix.to_string(), Err(reason.to_string())));
        self
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|call| call.starts_with(prefix))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, FirmwareUpdateError> {
        let line = command_line(program, args);
        self.calls.lock().push(line.clone());

        let responses = self.responses.lock();
        match responses.iter().find(|(prefix, _)| line.starts_with(prefix.as_str())) {
            Some((_, Ok(output))) => Ok(output.clone()),
            Some((_, Err(reason))) => Err(FirmwareUpdateError::Command {
                command: line,
                reason: reason.clone(),
            }),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

/// Restart that reports the requested plan on a channel
pub struct RecordingRestart {
    sender: Mutex<Sender<RebootPlan>>,
}

impl RecordingRestart {
    pub fn new() -> (Arc<Self>, Receiver<RebootPlan>) {
        let (sender, receiver) = channel();
        (
            Arc::new(Self {
                sender: Mutex::new(sender),
            }),
            receiver,
        )
    }

    fn record(&self, plan: RebootPlan) -> Result<(), FirmwareUpdateError> {
        self.sender
            .lock()
            .send(plan)
            .map_err(|e| FirmwareUpdateError::InvalidState(e.to_string()))
    }
}

impl SystemRestart for RecordingRestart {
    fn restart(&self) -> Result<(), FirmwareUpdateError> {
        self.record(RebootPlan::Direct)
    }

    fn restart_to_recovery(&self) -> Result<(), FirmwareUpdateError> {
        self.record(RebootPlan::Recovery)
    }
}

/// Recovery writer that remembers the staged packages
#[derive(Default)]
pub struct RecordingRecovery {
    pub packages: Mutex<Vec<std::path::PathBuf>>,
    pub cleared: AtomicUsize,
}

impl RecoveryWriter for RecordingRecovery {
    fn write_recovery(&self, package: &Path) -> Result<(), FirmwareUpdateError> {
        self.packages.lock().push(package.to_path_buf());
        Ok(())
    }

    fn clear_recovery(&self) -> Result<(), FirmwareUpdateError> {
        self.packages.lock().clear();
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Recovery writer that holds each install until the test releases it
pub struct GatedRecovery {
    pub inner: RecordingRecovery,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl GatedRecovery {
    /// Returns the writer, a receiver signalled when an install starts, and
    /// a sender that lets it finish.
    pub fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        (
            Arc::new(Self {
                inner: RecordingRecovery::default(),
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
            entered_rx,
            release_tx,
        )
    }
}

impl RecoveryWriter for GatedRecovery {
    fn write_recovery(&self, package: &Path) -> Result<(), FirmwareUpdateError> {
        self.entered
            .lock()
            .send(())
            .map_err(|e| FirmwareUpdateError::InvalidState(e.to_string()))?;
        self.release
            .lock()
            .recv_timeout(Duration::from_secs(5))
            .map_err(|e| FirmwareUpdateError::InvalidState(e.to_string()))?;
        self.inner.write_recovery(package)
    }

    fn clear_recovery(&self) -> Result<(), FirmwareUpdateError> {
        self.inner.clear_recovery()
    }
}

/// Streaming engine that collects the image on its own thread
pub struct FakeEngine {
    result: EndStatus,
    pub received: Arc<Mutex<Vec<u8>>>,
    pub chunks: Arc<AtomicUsize>,
    pub requests: Mutex<Vec<StreamRequest>>,
    session: Mutex<Option<Arc<StreamSession>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hold: Mutex<Option<Receiver<()>>>,
}

impl FakeEngine {
    pub fn new(result: EndStatus) -> Arc<Self> {
        Arc::new(Self {
            result,
            received: Arc::new(Mutex::new(Vec::new())),
            chunks: Arc::new(AtomicUsize::new(0)),
            requests: Mutex::new(Vec::new()),
            session: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            hold: Mutex::new(None),
        })
    }

    /// Make the next session wait for the returned sender before reporting
    /// completion.
    pub fn hold_completion(&self) -> Sender<()> {
        let (sender, receiver) = channel();
        *self.hold.lock() = Some(receiver);
        sender
    }

    pub fn session(&self) -> Option<Arc<StreamSession>> {
        self.session.lock().clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    /// Wait until the current session's slot has been drained.
    pub fn wait_drained(&self) -> bool {
        match self.session() {
            Some(session) => wait_until(Duration::from_secs(5), || !session.chunk_pending()),
            None => false,
        }
    }

    pub fn join(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("engine worker panicked");
            }
        }
    }
}

impl StreamingEngine for FakeEngine {
    fn start(
        &self,
        request: StreamRequest,
        session: Arc<StreamSession>,
    ) -> Result<(), FirmwareUpdateError> {
        self.requests.lock().push(request);
        *self.session.lock() = Some(Arc::clone(&session));
        self.received.lock().clear();
        self.chunks.store(0, Ordering::SeqCst);

        let received = Arc::clone(&self.received);
        let chunks = Arc::clone(&self.chunks);
        let result = self.result;
        let hold = self.hold.lock().take();
        let worker = std::thread::Builder::new()
            .name("fake-engine".to_string())
            .spawn(move || {
                while let Some(chunk) = session.pull_chunk() {
                    received.lock().extend_from_slice(&chunk);
                    let count = chunks.fetch_add(1, Ordering::SeqCst);
                    session.progress(1, &format!("chunk {count}"));
                }
                if let Some(hold) = hold
                    && hold.recv_timeout(Duration::from_secs(5)).is_err()
                {
                    tracing::warn!("engine hold not released");
                }
                let status = if session.is_aborted() {
                    EndStatus::Failure
                } else {
                    result
                };
                session.complete(status);
            })
            .map_err(|e| FirmwareUpdateError::StreamingFailed(e.to_string()))?;
        self.workers.lock().push(worker);
        Ok(())
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Deterministic test blob.
pub fn blob(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from((i.wrapping_mul(31).wrapping_add(i / 7)) % 251).unwrap_or(0))
        .collect()
}

/// Write `<dir>/<file>` as a zip archive holding `entry` with `data`.
pub fn write_fragment(dir: &Path, file: &str, entry: &str, data: &[u8]) -> std::io::Result<()> {
    let mut zip = ZipWriter::new(File::create(dir.join(file))?);
    zip.start_file(entry, SimpleFileOptions::default())
        .map_err(std::io::Error::other)?;
    zip.write_all(data)?;
    zip.finish().map_err(std::io::Error::other)?;
    Ok(())
}

/// Split `data` into `count` fragments named `<name><i>.zip` under `dir`.
pub fn write_fragments(dir: &Path, name: &str, data: &[u8], count: usize) -> std::io::Result<()> {
    let piece = data.len().div_ceil(count.max(1)).max(1);
    let entry = format!("{name}.swu");
    for (index, slice) in data.chunks(piece).enumerate() {
        write_fragment(dir, &format!("{name}{index}.zip"), &entry, slice)?;
    }
    Ok(())
}

/// Manifest text for a package of `data` split under `src_dir`.
pub fn manifest_text(
    name: &str,
    size: u64,
    fragments: usize,
    checksum: u32,
    src_dir: &Path,
) -> String {
    format!(
        "size = {size}\nfragments = {fragments}\nname = \"{name}\"\nchecksum = {checksum}\nsrc_dir = \"{}\"\n",
        src_dir.display()
    )
}
