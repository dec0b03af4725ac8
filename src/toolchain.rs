//! Build and flash through an external toolchain.
//!
//! The orchestrator only needs to know whether the board now runs the new
//! firmware, so every failure mode (missing sketch, missing executable,
//! non-zero exit, timeout, cancellation) collapses to an unsuccessful
//! [`FlashReport`]. The captured output is kept for logging.

use crate::board::BuildFlashJob;
use crate::config::HarnessConfig;
use log::{debug, error, info};
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often a running toolchain process is checked for exit.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum captured toolchain output; older output is dropped first.
const MAX_DIAGNOSTIC_BYTES: usize = 1024 * 1024;

/// RAII guard to ensure child process is always cleaned up.
///
/// On unix the child must lead its own process group (see [`ArduinoCli`]),
/// so uploaders it started die with it and release the port.
pub struct ProcessGuard(pub Child);

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        kill_group(&mut self.0);
        let _ = self.0.wait();
    }
}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) only sends a signal; an empty group fails with ESRCH.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

/// Result of one build-and-flash invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    /// True iff the firmware was built and written to the board.
    pub success: bool,
    /// Raw toolchain output plus the failure cause, if any.
    pub diagnostics: String,
}

impl FlashReport {
    pub fn succeeded(diagnostics: impl Into<String>) -> Self {
        Self {
            success: true,
            diagnostics: diagnostics.into(),
        }
    }

    pub fn failed(diagnostics: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostics: diagnostics.into(),
        }
    }

    /// Last non-empty diagnostic line, usually the most specific error.
    pub fn summary(&self) -> &str {
        self.diagnostics
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

/// Something that can build firmware and write it to a board.
pub trait Toolchain: Send + Sync {
    /// Build `job.sketch` for the job's board/variant and flash it over `job.port`.
    ///
    /// Must return once the toolchain exits, its time budget is spent or
    /// `cancel` fires. Never retries.
    fn build_and_flash(&self, job: &BuildFlashJob, cancel: &CancellationToken) -> FlashReport;
}

/// Reasons a toolchain invocation did not succeed.
#[derive(Debug)]
pub enum ToolchainError {
    /// Sketch source does not exist.
    MissingSketch(PathBuf),
    /// Failed to start or wait on the toolchain process.
    CommandFailed(String),
    /// Process exited unsuccessfully.
    Exit(ExitStatus),
    /// Process ran longer than the allowed time.
    TimedOut(Duration),
    /// Run was cancelled.
    Cancelled,
}

impl fmt::Display for ToolchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSketch(path) => write!(f, "sketch not found: {}", path.display()),
            Self::CommandFailed(e) => write!(f, "command failed: {}", e),
            Self::Exit(status) => write!(f, "toolchain exited with {}", status),
            Self::TimedOut(t) => write!(f, "toolchain timed out after {} seconds", t.as_secs()),
            Self::Cancelled => write!(f, "toolchain run cancelled"),
        }
    }
}

impl std::error::Error for ToolchainError {}

/// `arduino-cli compile --upload` invoker.
#[derive(Debug, Clone)]
pub struct ArduinoCli {
    cli_path: PathBuf,
    cli_args: Vec<String>,
    platform: String,
    timeout: Duration,
}

impl ArduinoCli {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            cli_args: config.cli_args.clone(),
            platform: config.platform.clone(),
            timeout: config.build_timeout,
        }
    }

    /// The command that builds and uploads `job`.
    pub fn command(&self, job: &BuildFlashJob) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(&self.cli_args)
            .arg("compile")
            .arg("--fqbn")
            .arg(job.fqbn(&self.platform))
            .arg("--upload")
            .arg("--port")
            .arg(&job.port)
            .arg(&job.sketch);
        cmd
    }

    /// Run the toolchain; the error side carries whatever output was captured.
    fn run(
        &self,
        job: &BuildFlashJob,
        cancel: &CancellationToken,
    ) -> Result<String, (ToolchainError, String)> {
        if !job.sketch.is_file() {
            return Err((ToolchainError::MissingSketch(job.sketch.clone()), String::new()));
        }

        let mut cmd = self.command(job);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                (
                    ToolchainError::CommandFailed(format!("{}: {}", self.cli_path.display(), e)),
                    String::new(),
                )
            })?;

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_collector(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_collector(stderr, output.clone()));
        }

        // Guard kills the process on every path out of this block
        let waited = {
            let mut guard = ProcessGuard(child);
            wait_for_exit(&mut guard.0, self.timeout, cancel)
        };

        // Readers only finish once every pipe writer is gone. A descendant
        // that left the process group can outlive the kill and hold them open.
        if waited.is_ok() {
            for reader in readers {
                let _ = reader.join();
            }
        }
        let text = snapshot(&output);

        match waited {
            Ok(status) if status.success() => Ok(text),
            Ok(status) => Err((ToolchainError::Exit(status), text)),
            Err(e) => Err((e, text)),
        }
    }
}

impl Toolchain for ArduinoCli {
    fn build_and_flash(&self, job: &BuildFlashJob, cancel: &CancellationToken) -> FlashReport {
        info!(
            "Building and flashing {} for '{}' on '{}' via {}",
            job.sketch.display(),
            job.variant,
            job.board,
            job.port
        );

        match self.run(job, cancel) {
            Ok(output) => {
                debug!("Toolchain output:\n{}", output);
                FlashReport::succeeded(output)
            }
            Err((e, output)) => {
                debug!("Toolchain output:\n{}", output);
                error!(
                    "Build/upload failed for '{}' on '{}': {}",
                    job.variant, job.board, e
                );
                let diagnostics = if output.is_empty() {
                    e.to_string()
                } else {
                    format!("{}\n{}", output.trim_end(), e)
                };
                FlashReport::failed(diagnostics)
            }
        }
    }
}

/// Wait for `child` to exit, bounded by `timeout` and `cancel`.
fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ToolchainError> {
    let start = Instant::now();
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| ToolchainError::CommandFailed(e.to_string()))?
        {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            return Err(ToolchainError::Cancelled);
        }
        if start.elapsed() >= timeout {
            return Err(ToolchainError::TimedOut(timeout));
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// Copy everything from `source` into `sink` until EOF.
fn spawn_collector<R>(mut source: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        out.extend_from_slice(&buf[..n]);
                        if out.len() > MAX_DIAGNOSTIC_BYTES {
                            let excess = out.len() - MAX_DIAGNOSTIC_BYTES;
                            out.drain(..excess);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

fn snapshot(output: &Mutex<Vec<u8>>) -> String {
    match output.lock() {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => String::new(),
    }
}
