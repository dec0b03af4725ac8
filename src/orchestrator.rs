//! Build, flash and verify one test case on one board.
//!
//! A run moves through [`Stage`]s:
//!
//! ```text
//! NotApplicable                        (variant mismatch, nothing touched)
//! Building -> WaitingPattern(1..=N) -> Passed
//!     \______________\________________-> Failed
//! ```
//!
//! The serial channel is opened only after a successful flash and is owned
//! by a [`ChannelGuard`], so it is released exactly once on every path,
//! including cancellation and unwinding.

use crate::board::{BoardTarget, BuildFlashJob, Variant};
use crate::config::HarnessConfig;
use crate::poller::{PatternPoller, WaitResult};
use crate::serial::{ChannelFactory, ChannelGuard, SerialError};
use crate::toolchain::Toolchain;
use log::{debug, error, info};
use std::fmt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// A firmware behaviour check for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    /// Unique name, used for filtering and reports.
    pub name: &'static str,
    /// One line summary.
    pub description: &'static str,
    /// Only boards running this variant execute the case.
    pub variant: &'static str,
    /// Sketch source, relative to the configured sketch root.
    pub sketch: &'static str,
    /// Literal text the firmware must print, in this order.
    pub patterns: &'static [&'static str],
    /// Per-pattern timeout; falls back to the harness default.
    pub pattern_timeout: Option<Duration>,
}

impl TestCase {
    /// Returns true if the case runs under `variant`.
    pub fn applies_to(&self, variant: &Variant) -> bool {
        variant.is(self.variant)
    }

    pub fn sketch_path(&self) -> &Path {
        Path::new(self.sketch)
    }
}

/// Position of a running test case in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Building,
    /// Waiting for the pattern at this 1-based index.
    WaitingPattern(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => write!(f, "build/flash"),
            Self::WaitingPattern(i) => write!(f, "pattern {}", i),
        }
    }
}

/// Why a test case failed.
#[derive(Debug)]
pub enum HarnessError {
    /// Toolchain did not build and flash the sketch.
    BuildFlash { summary: String },
    /// Serial port could not be opened after flashing.
    PortUnavailable(SerialError),
    /// Pattern `index` (1-based) did not appear in time.
    PatternTimeout {
        index: usize,
        pattern: String,
        timeout: Duration,
    },
    /// Serial reads failed while waiting for pattern `index`.
    ChannelLost { index: usize, reason: String },
    /// Run was cancelled during `stage`.
    Cancelled { stage: Stage },
}

impl HarnessError {
    /// Stage the run was in when it failed.
    pub fn stage(&self) -> Stage {
        match self {
            Self::BuildFlash { .. } | Self::PortUnavailable(_) => Stage::Building,
            Self::PatternTimeout { index, .. } | Self::ChannelLost { index, .. } => {
                Stage::WaitingPattern(*index)
            }
            Self::Cancelled { stage } => *stage,
        }
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildFlash { summary } if summary.is_empty() => {
                write!(f, "build/flash failure")
            }
            Self::BuildFlash { summary } => write!(f, "build/flash failure: {}", summary),
            Self::PortUnavailable(e) => write!(f, "build/flash failure: {}", e),
            Self::PatternTimeout {
                index,
                pattern,
                timeout,
            } => write!(
                f,
                "serial response check failed: pattern {} {:?} not seen within {:.1}s",
                index,
                pattern,
                timeout.as_secs_f64()
            ),
            Self::ChannelLost { index, reason } => write!(
                f,
                "serial channel lost while waiting for pattern {}: {}",
                index, reason
            ),
            Self::Cancelled { stage } => write!(f, "cancelled during {}", stage),
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PortUnavailable(e) => Some(e),
            _ => None,
        }
    }
}

/// A failed run with the board and variant it ran on.
#[derive(Debug)]
pub struct Failure {
    pub board: String,
    pub variant: String,
    pub error: HarnessError,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' on '{}': {}",
            self.variant, self.board, self.error
        )
    }
}

/// Result of one test case.
///
/// Drivers consume it as the `(ran, success)` pair from [`Outcome::as_pair`]:
/// `(false, true)` skipped, `(true, true)` passed, `(true, false)` failed.
#[derive(Debug)]
pub enum Outcome {
    NotApplicable,
    Passed,
    Failed(Failure),
}

impl Outcome {
    /// False only when the case was skipped.
    pub fn ran(&self) -> bool {
        !matches!(self, Self::NotApplicable)
    }

    /// False only when the case ran and failed; a skipped case counts as success.
    pub fn success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    /// `(ran, success)`.
    pub fn as_pair(&self) -> (bool, bool) {
        (self.ran(), self.success())
    }

    /// Human readable failure reason.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Failed(failure) => Some(failure.to_string()),
            _ => None,
        }
    }

    /// Stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Self::Failed(failure) => Some(failure.error.stage()),
            _ => None,
        }
    }
}

/// Runs test cases against one board.
///
/// Holds no state between runs; create one per board when driving several
/// boards in parallel.
pub struct Orchestrator<'a> {
    toolchain: &'a dyn Toolchain,
    channels: &'a dyn ChannelFactory,
    config: &'a HarnessConfig,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        toolchain: &'a dyn Toolchain,
        channels: &'a dyn ChannelFactory,
        config: &'a HarnessConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            toolchain,
            channels,
            config,
            cancel,
        }
    }

    /// Run `case` on `target`, which is running `variant`.
    pub fn run(&self, case: &TestCase, target: &BoardTarget, variant: &Variant) -> Outcome {
        if !case.applies_to(variant) {
            debug!(
                "{}: skipped, requires variant '{}' (board runs '{}')",
                case.name, case.variant, variant
            );
            return Outcome::NotApplicable;
        }

        let started = Instant::now();
        match self.execute(case, target, variant) {
            Ok(()) => {
                info!(
                    "{}: passed for '{}' on '{}' in {:.1}s",
                    case.name,
                    variant,
                    target.board,
                    started.elapsed().as_secs_f64()
                );
                Outcome::Passed
            }
            Err(error) => {
                let failure = Failure {
                    board: target.board.clone(),
                    variant: variant.name.clone(),
                    error,
                };
                error!("{}: {}", case.name, failure);
                Outcome::Failed(failure)
            }
        }
    }

    fn execute(
        &self,
        case: &TestCase,
        target: &BoardTarget,
        variant: &Variant,
    ) -> Result<(), HarnessError> {
        enter(case, Stage::Building);
        self.check_cancel(Stage::Building)?;

        let job = BuildFlashJob::new(
            target,
            variant,
            &self.config.sketch_root,
            case.sketch_path(),
        );
        let report = self.toolchain.build_and_flash(&job, &self.cancel);
        self.check_cancel(Stage::Building)?;
        if !report.success {
            return Err(HarnessError::BuildFlash {
                summary: report.summary().to_string(),
            });
        }

        self.settle()?;

        let mut channel = ChannelGuard::new(
            self.channels
                .open(&target.port)
                .map_err(HarnessError::PortUnavailable)?,
        );
        let mut poller = PatternPoller::new(self.config.poll_interval, self.cancel.clone());
        let timeout = case.pattern_timeout.unwrap_or(self.config.pattern_timeout);

        for (i, pattern) in case.patterns.iter().enumerate() {
            let index = i + 1;
            enter(case, Stage::WaitingPattern(index));
            match poller.await_pattern(&mut *channel, pattern, timeout) {
                WaitResult::Matched => {}
                WaitResult::TimedOut => {
                    debug!(
                        "{}: unmatched output: {:?}",
                        case.name,
                        String::from_utf8_lossy(poller.pending())
                    );
                    return Err(HarnessError::PatternTimeout {
                        index,
                        pattern: pattern.to_string(),
                        timeout,
                    })
                }
                WaitResult::Cancelled => {
                    return Err(HarnessError::Cancelled {
                        stage: Stage::WaitingPattern(index),
                    })
                }
                WaitResult::ChannelLost(reason) => {
                    return Err(HarnessError::ChannelLost { index, reason })
                }
            }
        }

        channel.close();
        Ok(())
    }

    fn check_cancel(&self, stage: Stage) -> Result<(), HarnessError> {
        if self.cancel.is_cancelled() {
            Err(HarnessError::Cancelled { stage })
        } else {
            Ok(())
        }
    }

    /// Give the board time to reboot into the new firmware.
    fn settle(&self) -> Result<(), HarnessError> {
        let started = Instant::now();
        loop {
            self.check_cancel(Stage::Building)?;
            let elapsed = started.elapsed();
            if elapsed >= self.config.settle_delay {
                return Ok(());
            }
            thread::sleep(self.config.poll_interval.min(self.config.settle_delay - elapsed));
        }
    }
}

fn enter(case: &TestCase, stage: Stage) {
    match stage {
        Stage::WaitingPattern(i) => debug!(
            "{}: waiting for pattern {}/{}: {:?}",
            case.name,
            i,
            case.patterns.len(),
            case.patterns[i - 1]
        ),
        _ => debug!("{}: {}", case.name, stage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cases::HIL_MATTER_SMOKE;
    use crate::serial::fake::ScriptedFactory;
    use crate::toolchain::FlashReport;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Toolchain returning a fixed result and recording its jobs.
    struct StubToolchain {
        success: bool,
        calls: AtomicUsize,
        jobs: Mutex<Vec<BuildFlashJob>>,
    }

    impl StubToolchain {
        fn new(success: bool) -> Self {
            Self {
                success,
                calls: AtomicUsize::new(0),
                jobs: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Toolchain for StubToolchain {
        fn build_and_flash(&self, job: &BuildFlashJob, _cancel: &CancellationToken) -> FlashReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.jobs.lock().unwrap().push(job.clone());
            if self.success {
                FlashReport::succeeded("Upload complete")
            } else {
                FlashReport::failed("Compiling...\nError during Upload: port busy")
            }
        }
    }

    const TWO_OK: TestCase = TestCase {
        name: "double_ok",
        description: "Same text expected twice",
        variant: "matter",
        sketch: "sketches/ok/ok.ino",
        patterns: &["OK", "OK"],
        pattern_timeout: Some(Duration::from_millis(200)),
    };

    fn config() -> HarnessConfig {
        HarnessConfig {
            sketch_root: PathBuf::from("/hil"),
            pattern_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            ..HarnessConfig::default()
        }
    }

    fn uno() -> BoardTarget {
        BoardTarget::new("uno", "/dev/ttyACM0")
    }

    fn matter() -> Variant {
        Variant::new("matter")
    }

    const QR_LINE: &str =
        "QR code URL: https://project-chip.github.io/connectedhomeip/qrcode.html?data=MT:6FCJ142C00KA0648G00\r\n";

    #[test]
    fn test_other_variant_is_skipped_without_side_effects() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        for name in ["ble_silabs", "noradio", "MATTER", ""] {
            let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &Variant::new(name));
            assert_eq!(outcome.as_pair(), (false, true));
            assert_eq!(outcome.reason(), None);
            assert_eq!(outcome.failed_stage(), None);
        }
        assert_eq!(toolchain.calls(), 0);
        assert_eq!(channels.counters.opens(), 0);
    }

    #[test]
    fn test_build_failure_never_opens_channel() {
        let toolchain = StubToolchain::new(false);
        let channels = ScriptedFactory::new(&["Matter device is not commissioned\n"]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, false));
        let reason = outcome.reason().unwrap();
        assert!(reason.contains("build/flash failure"), "{}", reason);
        assert!(reason.contains("port busy"), "{}", reason);
        assert!(reason.contains("'matter' on 'uno'"), "{}", reason);
        assert_eq!(toolchain.calls(), 1);
        assert_eq!(channels.counters.opens(), 0);
        assert_eq!(channels.counters.closes(), 0);
    }

    #[test]
    fn test_job_describes_board_variant_sketch_and_port() {
        let toolchain = StubToolchain::new(false);
        let channels = ScriptedFactory::new(&[]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        let jobs = toolchain.jobs.lock().unwrap();
        assert_eq!(
            jobs[0],
            BuildFlashJob {
                board: "uno".into(),
                variant: "matter".into(),
                sketch: PathBuf::from("/hil/sketches/hil_matter_smoke/hil_matter_smoke.ino"),
                port: "/dev/ttyACM0".into(),
            }
        );
    }

    #[test]
    fn test_matter_smoke_passes() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[
            "Matter device is not commissioned\r\n",
            "Please commission it using Android/iOS\r\n",
            QR_LINE,
            "Matter smoke test running! uptime: 5\r\n",
        ]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, true));
        assert_eq!(outcome.failed_stage(), None);
        assert_eq!(channels.counters.opens(), 1);
        assert_eq!(channels.counters.closes(), 1);
    }

    #[test]
    fn test_patterns_split_across_reads_pass() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[
            "boot\r\nMatter device is not com",
            "missioned\r\nQR code URL: https://project-chip.github.io/connectedhomeip/qr",
            "code.html?data=MT:Y.K90\r\nMatter smoke test run",
            "ning! uptime:",
            " 1\r\n",
        ]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, true));
        assert_eq!(channels.counters.closes(), 1);
    }

    #[test]
    fn test_missing_qr_code_fails_at_pattern_two() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[
            "Matter device is not commissioned\r\n",
            "Matter smoke test running! uptime: 5\r\n",
        ]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, false));
        let reason = outcome.reason().unwrap();
        assert!(reason.contains("pattern 2"), "{}", reason);
        assert!(reason.contains("QR code URL"), "{}", reason);
        assert_eq!(outcome.failed_stage(), Some(Stage::WaitingPattern(2)));
        assert_eq!(channels.counters.opens(), 1);
        assert_eq!(channels.counters.closes(), 1);
    }

    #[test]
    fn test_out_of_order_output_fails() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[
            QR_LINE,
            "Matter device is not commissioned\r\n",
            "Matter smoke test running! uptime: 5\r\n",
        ]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, false));
        assert!(outcome.reason().unwrap().contains("pattern 2"));
    }

    #[test]
    fn test_repeated_pattern_needs_two_occurrences() {
        let toolchain = StubToolchain::new(true);
        let config = config();

        let twice = ScriptedFactory::new(&["OK", "\r\nOK\r\n"]);
        let orch = Orchestrator::new(&toolchain, &twice, &config, CancellationToken::new());
        assert_eq!(orch.run(&TWO_OK, &uno(), &matter()).as_pair(), (true, true));

        let once = ScriptedFactory::new(&["OK\r\n"]);
        let orch = Orchestrator::new(&toolchain, &once, &config, CancellationToken::new());
        let outcome = orch.run(&TWO_OK, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, false));
        assert!(outcome.reason().unwrap().contains("pattern 2"));
        assert_eq!(once.counters.closes(), 1);
    }

    #[test]
    fn test_port_unavailable_is_build_class_failure() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::unavailable();
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, false));
        let reason = outcome.reason().unwrap();
        assert!(reason.contains("build/flash failure"), "{}", reason);
        assert!(reason.contains("/dev/ttyACM0"), "{}", reason);
        assert_eq!(channels.counters.closes(), 0);
    }

    #[test]
    fn test_cancelled_before_build_does_nothing() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[]);
        let config = config();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let orch = Orchestrator::new(&toolchain, &channels, &config, cancel);

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, false));
        assert!(outcome.reason().unwrap().contains("cancelled during build/flash"));
        assert_eq!(toolchain.calls(), 0);
        assert_eq!(channels.counters.opens(), 0);
    }

    #[test]
    fn test_unbounded_pattern_timeout_yields_outcome() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[
            "Matter device is not commissioned\r\n",
            QR_LINE,
            "Matter smoke test running! uptime: 5\r\n",
        ]);
        let config = HarnessConfig {
            pattern_timeout: Duration::from_secs(u64::MAX),
            ..config()
        };
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        assert_eq!(outcome.as_pair(), (true, true));
        assert_eq!(channels.counters.closes(), 1);
    }

    #[test]
    fn test_cancel_during_unbounded_settle() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&[]);
        let config = HarnessConfig {
            settle_delay: Duration::MAX,
            ..config()
        };
        let cancel = CancellationToken::new();
        let orch = Orchestrator::new(&toolchain, &channels, &config, cancel.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        canceller.join().unwrap();

        assert_eq!(outcome.failed_stage(), Some(Stage::Building));
        assert!(outcome.reason().unwrap().contains("cancelled during build/flash"));
        assert_eq!(channels.counters.opens(), 0);
    }

    #[test]
    fn test_cancel_while_waiting_releases_channel() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&["Matter device is not commissioned\r\n"]);
        let config = HarnessConfig {
            pattern_timeout: Duration::from_secs(30),
            ..config()
        };
        let cancel = CancellationToken::new();
        let orch = Orchestrator::new(&toolchain, &channels, &config, cancel.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let start = Instant::now();
        let outcome = orch.run(&HIL_MATTER_SMOKE, &uno(), &matter());
        canceller.join().unwrap();

        assert_eq!(outcome.as_pair(), (true, false));
        assert!(outcome.reason().unwrap().contains("cancelled during pattern 2"));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(channels.counters.closes(), 1);
    }

    #[test]
    fn test_settle_delay_before_open() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&["OK OK"]);
        let config = HarnessConfig {
            settle_delay: Duration::from_millis(50),
            ..config()
        };
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        let start = Instant::now();
        assert_eq!(orch.run(&TWO_OK, &uno(), &matter()).as_pair(), (true, true));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_sequential_runs_reopen_same_port() {
        let toolchain = StubToolchain::new(true);
        let channels = ScriptedFactory::new(&["OK OK"]);
        let config = config();
        let orch = Orchestrator::new(&toolchain, &channels, &config, CancellationToken::new());

        for _ in 0..3 {
            assert_eq!(orch.run(&TWO_OK, &uno(), &matter()).as_pair(), (true, true));
        }
        assert_eq!(channels.counters.opens(), 3);
        assert_eq!(channels.counters.closes(), 3);
    }

    #[test]
    fn test_error_display() {
        let e = HarnessError::PatternTimeout {
            index: 2,
            pattern: "QR".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            e.to_string(),
            "serial response check failed: pattern 2 \"QR\" not seen within 30.0s"
        );
        assert_eq!(
            HarnessError::BuildFlash {
                summary: String::new()
            }
            .to_string(),
            "build/flash failure"
        );
        assert_eq!(Stage::WaitingPattern(3).to_string(), "pattern 3");
    }
}
