//! Board, variant and build job descriptions.
//!
//! These are plain values handed to the orchestrator by the driver. A
//! [`BuildFlashJob`] is created for each test case execution and thrown away
//! afterwards.

use std::fmt;
use std::path::{Path, PathBuf};

/// A physical board connected to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTarget {
    /// Board identifier as known to the toolchain (e.g. "nano_matter").
    pub board: String,
    /// Serial port the board is attached to (e.g. "/dev/ttyACM0").
    pub port: String,
}

impl BoardTarget {
    pub fn new(board: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            board: board.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for BoardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.board, self.port)
    }
}

/// Firmware configuration selected for a run (e.g. "matter", "ble_silabs").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub name: String,
}

impl Variant {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns true if this variant is the one named.
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One build-and-flash invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFlashJob {
    pub board: String,
    pub variant: String,
    /// Resolved path to the sketch source.
    pub sketch: PathBuf,
    pub port: String,
}

impl BuildFlashJob {
    /// Build a job for `target` running `variant`, resolving `sketch` against `root`.
    ///
    /// Absolute sketch paths are used as given.
    pub fn new(target: &BoardTarget, variant: &Variant, root: &Path, sketch: &Path) -> Self {
        Self {
            board: target.board.clone(),
            variant: variant.name.clone(),
            sketch: root.join(sketch),
            port: target.port.clone(),
        }
    }

    /// Fully qualified board name for the toolchain.
    ///
    /// Format: `<platform>:<board>:protocol_stack=<variant>`
    pub fn fqbn(&self, platform: &str) -> String {
        format!("{}:{}:protocol_stack={}", platform, self.board, self.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_resolves_relative_sketch() {
        let target = BoardTarget::new("nano_matter", "/dev/ttyACM0");
        let job = BuildFlashJob::new(
            &target,
            &Variant::new("matter"),
            Path::new("/work/hil"),
            Path::new("sketches/smoke/smoke.ino"),
        );
        assert_eq!(job.sketch, PathBuf::from("/work/hil/sketches/smoke/smoke.ino"));
        assert_eq!(job.port, "/dev/ttyACM0");
        assert_eq!(job.board, "nano_matter");
    }

    #[test]
    fn test_job_keeps_absolute_sketch() {
        let target = BoardTarget::new("uno", "COM3");
        let job = BuildFlashJob::new(
            &target,
            &Variant::new("matter"),
            Path::new("/work"),
            Path::new("/abs/hil_matter_smoke.ino"),
        );
        assert_eq!(job.sketch, PathBuf::from("/abs/hil_matter_smoke.ino"));
    }

    #[test]
    fn test_fqbn_format() {
        let target = BoardTarget::new("xg24devkit", "/dev/ttyACM1");
        let job = BuildFlashJob::new(
            &target,
            &Variant::new("matter"),
            Path::new("."),
            Path::new("a.ino"),
        );
        assert_eq!(
            job.fqbn("SiliconLabs:silabs"),
            "SiliconLabs:silabs:xg24devkit:protocol_stack=matter"
        );
    }

    #[test]
    fn test_variant_is() {
        let v = Variant::new("matter");
        assert!(v.is("matter"));
        assert!(!v.is("ble_silabs"));
        assert_eq!(v.to_string(), "matter");
    }

    #[test]
    fn test_board_display() {
        let target = BoardTarget::new("uno", "/dev/ttyUSB0");
        assert_eq!(target.to_string(), "uno (/dev/ttyUSB0)");
    }
}
