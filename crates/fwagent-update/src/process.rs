//! External command execution
//!
//! Boot classification, installs and stream preparation all shell out to
//! device tooling (`fw_printenv`, `update-firmware`, ...). They go through
//! [`CommandRunner`] so tests can script the tool responses.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use tracing::{debug, warn};

use crate::error::FirmwareUpdateError;

/// Interval between exit checks while a bounded command runs
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    /// Standard output
    pub stdout: String,
}

impl CommandOutput {
    /// Output with exit code 0.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
        }
    }

    /// Output with the given exit code.
    pub fn with_status(status: i32, stdout: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: stdout.into(),
        }
    }

    /// Whether the command exited with code 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Output lines.
    pub fn lines(&self) -> std::str::Lines<'_> {
        self.stdout.lines()
    }
}

/// Runs external commands and captures their standard output
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`.
    ///
    /// With a `timeout`, a command still running when it expires is killed
    /// and [`FirmwareUpdateError::Timeout`] is returned. A command that cannot
    /// be started is [`FirmwareUpdateError::Command`].
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, FirmwareUpdateError>;
}

/// Format a command line for logs and error messages.
pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl SystemCommandRunner {
    /// Create a runner.
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, FirmwareUpdateError> {
        let line = command_line(program, args);
        let command_error = |reason: String| FirmwareUpdateError::Command {
            command: line.clone(),
            reason,
        };

        debug!("Running '{}'", line);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| command_error(format!("unable to start: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| command_error("standard output not captured".to_string()))?;

        let reader = std::thread::Builder::new()
            .name("fwagent-cmd-output".to_string())
            .spawn(move || {
                let mut output = Vec::new();
                stdout.read_to_end(&mut output).map(|_| output)
            })
            .map_err(|e| command_error(format!("unable to read output: {e}")))?;

        let status = match timeout {
            None => child
                .wait()
                .map_err(|e| command_error(format!("wait failed: {e}")))?,
            Some(limit) => {
                let started = Instant::now();
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break status,
                        Ok(None) if started.elapsed() >= limit => {
                            warn!("'{}' did not finish within {:?}, killing it", line, limit);
                            kill_process_group(&mut child, &line);
                            if let Err(e) = child.wait() {
                                warn!("Unable to reap '{}': {}", line, e);
                            }
                            // A descendant that left the group may still hold
                            // the pipe; the reader exits once it closes.
                            drop(reader);
                            return Err(FirmwareUpdateError::Timeout(format!(
                                "'{line}' exceeded {limit:?}"
                            )));
                        }
                        Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
                        Err(e) => return Err(command_error(format!("wait failed: {e}"))),
                    }
                }
            }
        };

        let output = reader
            .join()
            .map_err(|_panic| command_error("output reader panicked".to_string()))?
            .map_err(|e| command_error(format!("unable to read output: {e}")))?;

        let output = CommandOutput {
            status: status.code(),
            stdout: String::from_utf8_lossy(&output).into_owned(),
        };
        debug!("'{}' exited with {:?}", line, output.status);
        Ok(output)
    }
}

/// Kill `child` and everything it started. Each command runs in its own
/// process group, led by the child.
fn kill_process_group(child: &mut Child, line: &str) {
    let group = i32::try_from(child.id()).map(Pid::from_raw);
    match group {
        Ok(group) => {
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                warn!("Unable to kill process group of '{}': {}", line, e);
            }
        }
        Err(e) => warn!("Process id of '{}' out of range: {}", line, e),
    }
    // The leader itself, in case the group signal missed it.
    if let Err(e) = child.kill() {
        debug!("Kill of '{}' after group signal: {}", line, e);
    }
}
