//! Hardware-in-the-loop test harness.
//!
//! Builds firmware for a board, flashes it through an external toolchain and
//! verifies its behaviour by watching the serial output for expected text, in
//! order, within time limits.
//!
//! The pipeline pieces are injected into the [`Orchestrator`] so each can be
//! replaced: [`Toolchain`] builds and flashes, [`ChannelFactory`] opens serial
//! channels, and the [`PatternPoller`] waits for text.

pub mod board;
pub mod cases;
pub mod config;
pub mod orchestrator;
pub mod poller;
pub mod report;
pub mod serial;
pub mod toolchain;

// Re-export commonly used items
pub use board::{BoardTarget, BuildFlashJob, Variant};
pub use config::{ConfigError, HarnessConfig};
pub use orchestrator::{Failure, HarnessError, Orchestrator, Outcome, Stage, TestCase};
pub use poller::{PatternPoller, StreamBuffer, WaitResult};
pub use report::{CaseResult, Summary};
pub use serial::{ChannelFactory, ChannelGuard, SerialChannel, SerialError, SerialPortFactory};
pub use toolchain::{ArduinoCli, FlashReport, Toolchain};
