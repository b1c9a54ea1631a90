//! On-the-fly install bridge
//!
//! The connector pushes chunks from its own thread while the streaming
//! engine pulls them from another. [`StreamSession`] is a single-slot
//! rendezvous between the two: a pushed chunk sits in the slot until the
//! engine takes it, and a second push before that overwrites it.
//!
//! Once the final chunk is in the slot the producer blocks until the engine
//! reports completion, then gives the engine a short grace period to mark
//! the image as applied.
//!
//! A session serves exactly one update and is dropped once it has been
//! signaled.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::FirmwareUpdateError;
use crate::partition::{RunningMode, StorageMedia};

/// Chunk size requested from the connector for streamed targets
pub const STREAM_CHUNK_SIZE: usize = 128 * 1024;

/// Wait granularity of the engine pulling the next chunk
pub const CHUNK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Wait granularity while the engine finalizes the image
pub const FINALIZE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Number of finalize waits before giving up
pub const FINALIZE_POLL_ATTEMPTS: u32 = 100;

/// What the streaming engine is asked to write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Flash technology
    pub storage_media: StorageMedia,
    /// Partition set to write
    pub running_mode: RunningMode,
}

/// Result reported by the streaming engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndStatus {
    /// Image written
    Success,
    /// Install failed
    Failure,
}

/// Action run after a successful streamed install, before completion is
/// signaled
pub trait PostUpdateAction: Send + Sync {
    /// Run the action.
    fn run(&self) -> Result<(), FirmwareUpdateError>;
}

/// [`PostUpdateAction`] that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPostUpdate;

impl PostUpdateAction for NoPostUpdate {
    fn run(&self) -> Result<(), FirmwareUpdateError> {
        Ok(())
    }
}

/// Streaming install engine
///
/// `start` must return once the install is running. The engine then pulls
/// chunks with [`StreamSession::pull_chunk`] from its own thread and calls
/// [`StreamSession::complete`] when done.
pub trait StreamingEngine: Send + Sync {
    /// Start an install of the image that will flow through `session`.
    fn start(
        &self,
        request: StreamRequest,
        session: Arc<StreamSession>,
    ) -> Result<(), FirmwareUpdateError>;
}

#[derive(Debug)]
struct SlotState {
    buffer: Vec<u8>,
    ready: bool,
    last_chunk_size: usize,
    final_pushed: bool,
    final_drained: bool,
    aborted: bool,
    completing: bool,
    end_status: Option<EndStatus>,
    applied: bool,
}

/// Single-slot producer/consumer handoff for one streamed update
pub struct StreamSession {
    state: Mutex<SlotState>,
    chunk_cv: Condvar,
    end_cv: Condvar,
    post_update: Arc<dyn PostUpdateAction>,
}

impl StreamSession {
    /// Create a session that runs `post_update` after a successful install.
    pub fn new(post_update: Arc<dyn PostUpdateAction>) -> Self {
        Self {
            state: Mutex::new(SlotState {
                buffer: Vec::with_capacity(STREAM_CHUNK_SIZE),
                ready: false,
                last_chunk_size: 0,
                final_pushed: false,
                final_drained: false,
                aborted: false,
                completing: false,
                end_status: None,
                applied: false,
            }),
            chunk_cv: Condvar::new(),
            end_cv: Condvar::new(),
            post_update,
        }
    }

    /// Hand one chunk to the engine.
    ///
    /// For the final chunk this blocks until the engine has finished: without
    /// a bound for the completion signal, then up to
    /// `FINALIZE_POLL_ATTEMPTS * FINALIZE_POLL_INTERVAL` for the image to be
    /// applied.
    pub fn push_chunk(&self, data: &[u8], last_chunk: bool) -> Result<(), FirmwareUpdateError> {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return Err(FirmwareUpdateError::Cancelled(
                    "streaming session aborted".to_string(),
                ));
            }
            if state.end_status == Some(EndStatus::Failure) {
                return Err(FirmwareUpdateError::StreamingFailed(
                    "engine already reported a failure".to_string(),
                ));
            }
            if state.ready {
                warn!(
                    "Previous chunk of {} bytes not consumed yet, overwriting it",
                    state.buffer.len()
                );
            }

            state.buffer.clear();
            state.buffer.extend_from_slice(data);
            state.ready = true;
            state.final_pushed = last_chunk;
            self.chunk_cv.notify_all();
        }

        if last_chunk {
            debug!("Final chunk handed to the streaming engine");
            self.wait_finalized()?;
        }
        Ok(())
    }

    fn wait_finalized(&self) -> Result<(), FirmwareUpdateError> {
        let mut state = self.state.lock();
        while state.end_status.is_none() {
            self.end_cv.wait(&mut state);
        }

        if state.end_status == Some(EndStatus::Failure) {
            error!("Firmware download streaming failed");
            return Err(FirmwareUpdateError::StreamingFailed(
                "engine reported a failure".to_string(),
            ));
        }

        let mut attempts = 0u32;
        while !state.applied {
            if attempts >= FINALIZE_POLL_ATTEMPTS {
                error!(
                    "Timeout waiting to finish on the fly update process ({})",
                    attempts
                );
                return Err(FirmwareUpdateError::Timeout(
                    "streaming engine did not finish applying the image".to_string(),
                ));
            }
            self.end_cv.wait_for(&mut state, FINALIZE_POLL_INTERVAL);
            attempts = attempts.saturating_add(1);
        }

        info!("On the fly update applied");
        Ok(())
    }

    /// Take the next chunk, waiting for the producer if needed.
    ///
    /// Returns `None` once the final chunk has been taken or the session was
    /// aborted.
    pub fn pull_chunk(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        loop {
            if state.aborted || state.final_drained {
                return None;
            }
            if state.ready {
                let chunk = std::mem::replace(
                    &mut state.buffer,
                    Vec::with_capacity(STREAM_CHUNK_SIZE),
                );
                state.ready = false;
                state.last_chunk_size = chunk.len();
                state.final_drained = state.final_pushed;
                return Some(chunk);
            }
            self.chunk_cv.wait_for(&mut state, CHUNK_POLL_INTERVAL);
        }
    }

    /// Log an engine progress report.
    pub fn progress(&self, status: i32, message: &str) {
        debug!("Status: {} message: {}", status, message);
    }

    /// Report the end of the install.
    ///
    /// On success the post-update action runs first; if it fails the install
    /// counts as failed. Only the first report of a session is kept.
    pub fn complete(&self, status: EndStatus) {
        {
            let mut state = self.state.lock();
            if state.completing || state.end_status.is_some() {
                debug!("Streaming session already signaled, ignoring {:?}", status);
                return;
            }
            state.completing = true;
        }

        let status = match status {
            EndStatus::Success => {
                info!("Executing post-update actions");
                match self.post_update.run() {
                    Ok(()) => EndStatus::Success,
                    Err(e) => {
                        error!("Running post-update failed: {}", e);
                        EndStatus::Failure
                    }
                }
            }
            EndStatus::Failure => EndStatus::Failure,
        };

        if self.signal_completion(status) && status == EndStatus::Success {
            self.mark_applied();
        }
    }

    /// Record the engine result and wake the producer.
    ///
    /// Returns `false` if the session was already signaled.
    pub fn signal_completion(&self, status: EndStatus) -> bool {
        let mut state = self.state.lock();
        if state.end_status.is_some() {
            return false;
        }
        state.end_status = Some(status);
        self.end_cv.notify_all();
        true
    }

    /// Mark the image as applied.
    pub fn mark_applied(&self) {
        let mut state = self.state.lock();
        state.applied = true;
        self.end_cv.notify_all();
    }

    /// Stop the stream and wait for the engine to wind down.
    ///
    /// Pending data is dropped and further pulls report end of stream.
    /// Blocks until the engine has signaled completion.
    pub fn abort(&self) -> EndStatus {
        let mut state = self.state.lock();
        state.aborted = true;
        state.ready = false;
        state.buffer.clear();
        self.chunk_cv.notify_all();

        while state.end_status.is_none() {
            self.end_cv.wait(&mut state);
        }
        state.end_status.unwrap_or(EndStatus::Failure)
    }

    /// Whether the engine has reported its result.
    pub fn is_signaled(&self) -> bool {
        self.state.lock().end_status.is_some()
    }

    /// Whether the session was aborted.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Whether the install succeeded and the image was applied.
    pub fn succeeded(&self) -> bool {
        let state = self.state.lock();
        state.end_status == Some(EndStatus::Success) && state.applied
    }

    /// Whether a pushed chunk is still waiting for the engine.
    pub fn chunk_pending(&self) -> bool {
        self.state.lock().ready
    }

    /// Size of the chunk the engine took last.
    pub fn last_chunk_size(&self) -> usize {
        self.state.lock().last_chunk_size
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
