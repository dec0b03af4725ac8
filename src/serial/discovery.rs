//! Locate the serial port of an attached board.
//!
//! The `PORT` environment variable always wins. Otherwise common USB serial
//! device names are scanned; Silicon Labs kits enumerate as J-Link CDC
//! devices (`ttyACM*` on Linux, `cu.usbmodem*` on macOS).

/// Environment variable naming the port explicitly.
pub const PORT_ENV: &str = "PORT";

/// Device name patterns tried in order.
const PORT_PATTERNS: &[&str] = &[
    "/dev/cu.usbmodem*",
    "/dev/cu.usbserial-*",
    "/dev/cu.SLAB_USBtoUART*",
    "/dev/ttyACM*",
    "/dev/ttyUSB*",
];

/// Outcome of port detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortResult {
    /// Exactly one candidate (or an explicit override).
    Found(String),
    /// More than one board attached; the caller must choose.
    MultipleDevices(Vec<String>),
    /// Nothing attached.
    NotFound,
}

/// Find the board port, honoring the `PORT` override.
pub fn get_board_port() -> PortResult {
    if let Ok(port) = std::env::var(PORT_ENV) {
        if !port.trim().is_empty() {
            return PortResult::Found(port.trim().to_string());
        }
    }
    select_port(scan(PORT_PATTERNS))
}

/// Reduce a candidate list to a [`PortResult`].
pub fn select_port(mut candidates: Vec<String>) -> PortResult {
    candidates.sort();
    candidates.dedup();
    match candidates.len() {
        0 => PortResult::NotFound,
        1 => PortResult::Found(candidates.remove(0)),
        _ => PortResult::MultipleDevices(candidates),
    }
}

/// List available serial ports for debugging.
pub fn list_available_ports() -> Vec<String> {
    // Linux USB serial patterns (more specific than /dev/tty* to avoid iterating
    // over hundreds of virtual terminals)
    scan(&["/dev/cu.*", "/dev/ttyUSB*", "/dev/ttyACM*"])
}

fn scan(patterns: &[&str]) -> Vec<String> {
    let mut found = Vec::new();
    for pattern in patterns {
        if let Ok(paths) = glob::glob(pattern) {
            found.extend(paths.flatten().map(|p| p.to_string_lossy().to_string()));
        }
    }
    found
}
