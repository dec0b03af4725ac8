//! Wait for expected text on a serial stream.
//!
//! Incoming bytes accumulate in a [`StreamBuffer`]. Each successful match
//! advances the buffer's cursor past the matched text, so a later pattern can
//! never be satisfied by output that an earlier pattern already claimed, while
//! text split across two reads is still found.
//!
//! # Example
//!
//! ```
//! use hil_harness::poller::StreamBuffer;
//!
//! let mut buffer = StreamBuffer::new();
//! buffer.push(b"boot... O");
//! buffer.push(b"K ready OK");
//! assert!(buffer.find_and_advance(b"OK"));
//! assert!(buffer.find_and_advance(b"OK"));
//! assert!(!buffer.find_and_advance(b"OK"));
//! ```

use crate::serial::SerialChannel;
use log::{debug, trace};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Maximum unmatched bytes kept while waiting; the oldest are dropped first.
///
/// Must stay well above the longest expected pattern.
pub const MAX_BACKLOG_BYTES: usize = 64 * 1024;

/// Longest partial line held for echoing before it is flushed as is.
const MAX_LINE_BYTES: usize = 4096;

/// Accumulated serial output with a forward-only match cursor.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Bytes after the cursor.
    pending: Vec<u8>,
    /// Stream offset of `pending[0]`; never decreases.
    cursor: u64,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_BACKLOG_BYTES {
            let excess = self.pending.len() - MAX_BACKLOG_BYTES;
            self.advance(excess);
        }
    }

    /// Search unconsumed output for `pattern`.
    ///
    /// On a hit everything up to the end of the match is consumed. An empty
    /// pattern matches without consuming anything.
    pub fn find_and_advance(&mut self, pattern: &[u8]) -> bool {
        if pattern.is_empty() {
            return true;
        }
        match find(&self.pending, pattern) {
            Some(start) => {
                self.advance(start + pattern.len());
                true
            }
            None => false,
        }
    }

    /// Unconsumed output.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Total bytes consumed so far.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    fn advance(&mut self, n: usize) {
        self.pending.drain(..n);
        self.cursor += n as u64;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits raw output into printable lines for logging.
///
/// Handles `\r\n` line endings and skips lines that are empty or only noise.
#[derive(Debug, Default)]
pub struct LineEcho {
    partial: Vec<u8>,
}

impl LineEcho {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || self.partial.len() >= MAX_LINE_BYTES {
                if let Some(line) = clean_line(&self.partial) {
                    lines.push(line);
                }
                self.partial.clear();
                if b == b'\n' {
                    continue;
                }
            }
            self.partial.push(b);
        }
        lines
    }
}

fn clean_line(raw: &[u8]) -> Option<String> {
    // Convert to string, replacing invalid UTF-8 with replacement char.
    let line = String::from_utf8_lossy(raw).trim().replace('\r', "");
    if line.is_empty() || line.chars().all(|c| c == '\u{FFFD}' || c.is_control()) {
        None
    } else {
        Some(line)
    }
}

/// Result of waiting for one pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// Pattern appeared in unconsumed output.
    Matched,
    /// Time budget spent without a match.
    TimedOut,
    /// Run was cancelled while waiting.
    Cancelled,
    /// Reading from the channel failed.
    ChannelLost(String),
}

impl WaitResult {
    /// True only for [`WaitResult::Matched`].
    pub fn matched(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

/// Polls a channel until expected text shows up.
///
/// One poller is used per test case so its buffer carries over from one
/// pattern to the next.
pub struct PatternPoller {
    poll_interval: Duration,
    cancel: CancellationToken,
    buffer: StreamBuffer,
    echo: LineEcho,
}

impl PatternPoller {
    /// `poll_interval` bounds each read, and so how quickly cancellation is noticed.
    pub fn new(poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            poll_interval,
            cancel,
            buffer: StreamBuffer::new(),
            echo: LineEcho::new(),
        }
    }

    /// Wait up to `timeout` (wall clock) for `pattern` to appear on `channel`.
    ///
    /// Empty reads are not errors; they only use up the budget.
    pub fn await_pattern(
        &mut self,
        channel: &mut dyn SerialChannel,
        pattern: &str,
        timeout: Duration,
    ) -> WaitResult {
        let started = Instant::now();
        loop {
            // Output from earlier reads may already contain the pattern
            if self.buffer.find_and_advance(pattern.as_bytes()) {
                debug!(
                    "Matched {:?} (stream offset {})",
                    pattern,
                    self.buffer.cursor()
                );
                return WaitResult::Matched;
            }
            if self.cancel.is_cancelled() {
                return WaitResult::Cancelled;
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return WaitResult::TimedOut;
            }

            match channel.read_available(self.poll_interval.min(timeout - elapsed)) {
                Ok(bytes) if bytes.is_empty() => trace!("No serial data"),
                Ok(bytes) => {
                    for line in self.echo.feed(&bytes) {
                        debug!("serial: {}", line);
                    }
                    self.buffer.push(&bytes);
                }
                Err(e) => return WaitResult::ChannelLost(e.to_string()),
            }
        }
    }

    /// Output received but not yet claimed by a pattern.
    pub fn pending(&self) -> &[u8] {
        self.buffer.pending()
    }
}
