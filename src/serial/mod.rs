//! Serial connection to the board under test.
//!
//! A [`SerialChannel`] is opened once per test case after a successful flash
//! and read with bounded timeouts until the case ends. [`ChannelGuard`] closes
//! it on every path out of the orchestrator.
//!
//! # Example
//!
//! ```ignore
//! use hil_harness::serial::{ChannelFactory, ChannelGuard, SerialPortFactory};
//! use std::time::Duration;
//!
//! let factory = SerialPortFactory::new(115_200);
//! let mut channel = ChannelGuard::new(factory.open("/dev/ttyACM0")?);
//! let bytes = channel.read_available(Duration::from_millis(100))?;
//! ```

pub mod discovery;

use log::debug;
use std::fmt;
use std::io::{self, Read};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

/// Size of a single read from the port.
const READ_CHUNK_SIZE: usize = 1024;

/// Byte stream from a board.
///
/// Implementations must not lose or reorder bytes between successive reads.
pub trait SerialChannel: Send {
    /// Read whatever arrives within `timeout`.
    ///
    /// Returns an empty vector if the device stayed silent.
    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, SerialError>;

    /// Release the port. Closing an already closed channel is a no-op.
    fn close(&mut self);

    /// Returns true until [`close`](Self::close) is called.
    fn is_open(&self) -> bool;
}

/// Opens channels by port name.
pub trait ChannelFactory: Send + Sync {
    /// Open `port`, failing with [`SerialError::PortUnavailable`] if it cannot be used.
    fn open(&self, port: &str) -> Result<Box<dyn SerialChannel>, SerialError>;
}

/// Serial errors.
#[derive(Debug)]
pub enum SerialError {
    /// Port could not be opened.
    PortUnavailable { port: String, reason: String },
    /// Channel was used after close.
    Closed,
    /// I/O error while reading.
    Io(io::Error),
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortUnavailable { port, reason } => {
                write!(f, "serial port {} unavailable: {}", port, reason)
            }
            Self::Closed => write!(f, "serial channel is closed"),
            Self::Io(e) => write!(f, "serial I/O error: {}", e),
        }
    }
}

impl std::error::Error for SerialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SerialError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Channel backed by a real serial port.
pub struct SerialPortChannel {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialPortChannel {
    /// Open `name` at `baud_rate` (8N1, no flow control).
    pub fn open(name: &str, baud_rate: u32) -> Result<Self, SerialError> {
        let port = serialport::new(name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| SerialError::PortUnavailable {
                port: name.to_string(),
                reason: e.to_string(),
            })?;
        debug!("Opened serial port {} at {} baud", name, baud_rate);
        Ok(Self {
            name: name.to_string(),
            port: Some(port),
        })
    }
}

impl SerialChannel for SerialPortChannel {
    fn read_available(&mut self, timeout: Duration) -> Result<Vec<u8>, SerialError> {
        let port = self.port.as_mut().ok_or(SerialError::Closed)?;
        port.set_timeout(timeout)
            .map_err(|e| SerialError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if is_silence(&e) => Ok(Vec::new()),
            Err(e) => Err(SerialError::Io(e)),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// Errors that only mean "nothing arrived yet".
fn is_silence(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Opens [`SerialPortChannel`]s at a fixed baud rate.
#[derive(Debug, Clone)]
pub struct SerialPortFactory {
    baud_rate: u32,
}

impl SerialPortFactory {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl ChannelFactory for SerialPortFactory {
    fn open(&self, port: &str) -> Result<Box<dyn SerialChannel>, SerialError> {
        Ok(Box::new(SerialPortChannel::open(port, self.baud_rate)?))
    }
}

/// RAII guard that closes the wrapped channel when dropped.
pub struct ChannelGuard(Box<dyn SerialChannel>);

impl ChannelGuard {
    pub fn new(channel: Box<dyn SerialChannel>) -> Self {
        Self(channel)
    }
}

impl Deref for ChannelGuard {
    type Target = dyn SerialChannel;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for ChannelGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if self.0.is_open() {
            debug!("Closing serial channel left open");
            self.0.close();
        }
    }
}
