//! Aggregate test case results.
//!
//! Results are rendered in TAP (Test Anything Protocol) form as they arrive
//! and can be written out as JSON at the end of a run.
//!
//! # Example
//!
//! ```
//! use hil_harness::report::{CaseResult, Summary};
//!
//! let mut summary = Summary::new();
//! let line = summary.record(CaseResult {
//!     case: "hil_matter_smoke".into(),
//!     board: "nano_matter".into(),
//!     variant: "ble_silabs".into(),
//!     ran: false,
//!     success: true,
//!     stage: None,
//!     reason: None,
//! });
//! assert!(line.starts_with("ok 1 - hil_matter_smoke [nano_matter/ble_silabs] # SKIP"));
//! assert!(summary.all_passed());
//! ```

use crate::board::{BoardTarget, Variant};
use crate::orchestrator::{Outcome, TestCase};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;

/// Result of one test case on one board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseResult {
    pub case: String,
    pub board: String,
    pub variant: String,
    pub ran: bool,
    pub success: bool,
    /// Stage that failed, e.g. `build/flash` or `pattern 2`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CaseResult {
    pub fn new(
        case: &TestCase,
        target: &BoardTarget,
        variant: &Variant,
        outcome: &Outcome,
    ) -> Self {
        let (ran, success) = outcome.as_pair();
        Self {
            case: case.name.to_string(),
            board: target.board.clone(),
            variant: variant.name.clone(),
            ran,
            success,
            stage: outcome.failed_stage().map(|s| s.to_string()),
            reason: outcome.reason(),
        }
    }

    /// Ran and failed.
    pub fn is_failure(&self) -> bool {
        self.ran && !self.success
    }
}

/// Collected results of a run.
#[derive(Debug, Default)]
pub struct Summary {
    results: Vec<CaseResult>,
}

/// JSON document written by [`Summary::write_json`].
#[derive(Serialize)]
struct JsonReport<'a> {
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    results: &'a [CaseResult],
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// TAP header for `planned` test points.
    pub fn header(planned: usize) -> String {
        format!("TAP version 14\n1..{}", planned)
    }

    /// Record a result, returning its TAP test point.
    pub fn record(&mut self, result: CaseResult) -> String {
        self.results.push(result);
        let num = self.results.len();
        let result = &self.results[num - 1];
        let name = format!("{} [{}/{}]", result.case, result.board, result.variant);

        if !result.ran {
            format!(
                "ok {} - {} # SKIP not applicable to variant '{}'",
                num, name, result.variant
            )
        } else if result.success {
            format!("ok {} - {}", num, name)
        } else {
            let mut point = format!("not ok {} - {}", num, name);
            if let Some(reason) = &result.reason {
                for line in reason.lines() {
                    point.push_str("\n# ");
                    point.push_str(line);
                }
            }
            point
        }
    }

    /// Closing diagnostics with the totals.
    pub fn footer(&self) -> String {
        format!(
            "# -----------------------\n\
             # Tests run: {}\n\
             # Passed: {}\n\
             # Failed: {}\n\
             # Skipped: {}\n\
             # Result: {}",
            self.ran(),
            self.passed(),
            self.failed(),
            self.skipped(),
            if self.all_passed() { "PASS" } else { "FAIL" }
        )
    }

    pub fn results(&self) -> &[CaseResult] {
        &self.results
    }

    pub fn ran(&self) -> usize {
        self.results.iter().filter(|r| r.ran).count()
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.ran && r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| !r.ran).count()
    }

    /// True if nothing failed; skipped cases do not count against the run.
    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&JsonReport {
            total: self.results.len(),
            passed: self.passed(),
            failed: self.failed(),
            skipped: self.skipped(),
            results: &self.results,
        })
    }

    /// Write the JSON report to `path`, creating parent directories.
    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}
