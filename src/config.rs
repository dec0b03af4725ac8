//! Harness configuration.
//!
//! Every wait in the pipeline is bounded by one of these values. Defaults are
//! tuned for Silicon Labs boards flashed through arduino-cli.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default toolchain executable.
pub const DEFAULT_CLI_PATH: &str = "arduino-cli";

/// Default FQBN platform prefix.
pub const DEFAULT_PLATFORM: &str = "SiliconLabs:silabs";

/// Outer timeout for a build and flash (Matter builds are slow).
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Time allowed for each expected pattern to appear.
pub const DEFAULT_PATTERN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-read timeout used by the poller.
///
/// Shorter values react faster to cancellation at the cost of more wakeups.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for any configured timeout or delay.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Serial baud rate of the firmware under test.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Settings shared by every test case of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Toolchain executable.
    pub cli_path: PathBuf,
    /// Global arguments placed before the subcommand (e.g. `--config-file`).
    pub cli_args: Vec<String>,
    /// FQBN platform prefix (`vendor:arch`).
    pub platform: String,
    /// Base directory for relative sketch paths.
    pub sketch_root: PathBuf,
    /// Outer timeout for build and flash.
    pub build_timeout: Duration,
    /// Default per-pattern timeout; test cases may override it.
    pub pattern_timeout: Duration,
    /// Per-read timeout inside the poller.
    pub poll_interval: Duration,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Pause between a successful flash and opening the serial port.
    pub settle_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from(DEFAULT_CLI_PATH),
            cli_args: Vec::new(),
            platform: DEFAULT_PLATFORM.to_string(),
            sketch_root: PathBuf::from("."),
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            pattern_timeout: DEFAULT_PATTERN_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            baud_rate: DEFAULT_BAUD_RATE,
            settle_delay: Duration::ZERO,
        }
    }
}

impl HarnessConfig {
    /// Check that every wait is bounded and the toolchain is named.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cli_path.as_os_str().is_empty() {
            return Err(ConfigError::Empty("cli_path"));
        }
        if self.platform.is_empty() {
            return Err(ConfigError::Empty("platform"));
        }
        if self.build_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("build_timeout"));
        }
        if self.pattern_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("pattern_timeout"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll_interval"));
        }
        for (field, value) in [
            ("build_timeout", self.build_timeout),
            ("pattern_timeout", self.pattern_timeout),
            ("settle_delay", self.settle_delay),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::DurationTooLong {
                    field,
                    max: MAX_DURATION,
                });
            }
        }
        if self.poll_interval > self.pattern_timeout {
            return Err(ConfigError::PollIntervalTooLong {
                poll: self.poll_interval,
                timeout: self.pattern_timeout,
            });
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::ZeroBaudRate);
        }
        Ok(())
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required text setting is empty.
    Empty(&'static str),
    /// A timeout or interval is zero.
    ZeroDuration(&'static str),
    /// A timeout or delay exceeds [`MAX_DURATION`].
    DurationTooLong { field: &'static str, max: Duration },
    /// Poll interval exceeds the pattern timeout.
    PollIntervalTooLong { poll: Duration, timeout: Duration },
    /// Baud rate is zero.
    ZeroBaudRate,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty(field) => write!(f, "{} must not be empty", field),
            Self::ZeroDuration(field) => write!(f, "{} must be greater than zero", field),
            Self::DurationTooLong { field, max } => {
                write!(f, "{} must not exceed {} seconds", field, max.as_secs())
            }
            Self::PollIntervalTooLong { poll, timeout } => write!(
                f,
                "poll interval {:?} exceeds pattern timeout {:?}",
                poll, timeout
            ),
            Self::ZeroBaudRate => write!(f, "baud rate must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
