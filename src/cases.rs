//! Hardware-in-the-loop test cases.
//!
//! Expected patterns mirror what the sketches print. Any change to a
//! sketch's serial output must be reflected here.

use crate::orchestrator::TestCase;

/// Matter smoke test: the board boots uncommissioned, prints its pairing QR
/// code URL and then reports uptime from the main loop.
pub const HIL_MATTER_SMOKE: TestCase = TestCase {
    name: "hil_matter_smoke",
    description: "Builds and uploads the HIL Matter smoke sketch and checks the serial response",
    variant: "matter",
    sketch: "sketches/hil_matter_smoke/hil_matter_smoke.ino",
    patterns: &[
        "Matter device is not commissioned",
        "QR code URL: https://project-chip.github.io/connectedhomeip/qrcode.html?data=",
        "Matter smoke test running! uptime:",
    ],
    pattern_timeout: None,
};

/// Every known test case, in execution order.
pub const ALL_CASES: &[TestCase] = &[HIL_MATTER_SMOKE];

/// Look up a test case by name.
pub fn find(name: &str) -> Option<&'static TestCase> {
    ALL_CASES.iter().find(|c| c.name == name)
}
