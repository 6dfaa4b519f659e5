//! Transport abstraction for the bootloader link.
//!
//! The protocol engine never touches a serial port directly. It owns a value
//! implementing [`Transport`], which it configures, opens, writes to and
//! closes, and from which it pulls [`TransportEvent`]s when polled:
//!
//! ```text
//! +------------------+
//! |  Protocol Engine |  connect / program / disconnect
//! +--------+---------+
//!          |   write, clear_buffers, close
//!          v   ^ ReadyRead / BytesWritten / Fault
//! +--------+---------+
//! |  Transport Trait |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+     +------------------+
//! | NativePort       |     | in-memory ports  |
//! |   (serialport)   |     |   (tests)        |
//! +------------------+     +------------------+
//! ```
//!
//! Writes are fire-and-forget from the engine's point of view: the transport
//! reports the flush later as [`TransportEvent::BytesWritten`].

#[cfg(feature = "native")]
pub mod native;

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout of a single I/O call.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(10),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Line settings the chip45boot2 bootloader expects: 8 data bits, no
    /// parity, 2 stop bits, XON/XOFF flow control.
    pub fn bootloader(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self::new(port_name, baud_rate)
            .with_stop_bits(StopBits::Two)
            .with_flow_control(FlowControl::Software)
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Set the flow control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Kind of fault a transport can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportFault {
    /// Reading from the link failed.
    Read,
    /// Writing to the link failed.
    Write,
    /// The device behind the link is gone (unplugged).
    DeviceRemoved,
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::DeviceRemoved => write!(f, "device removed"),
        }
    }
}

/// Notification produced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A chunk of inbound bytes became available.
    ReadyRead(Vec<u8>),
    /// Previously written bytes were flushed to the link.
    BytesWritten(usize),
    /// The link reported a fault.
    Fault {
        /// Fault kind.
        fault: TransportFault,
        /// Description from the underlying driver.
        message: String,
    },
}

/// Byte channel driven by the protocol engine.
///
/// Implementations must never block for longer than their configured I/O
/// timeout: the engine is polled from a single thread and relies on every
/// call returning promptly.
pub trait Transport {
    /// Apply `config` and open the link.
    fn open(&mut self, config: &SerialConfig) -> Result<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Close the link. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Port name/path of the last configuration.
    fn name(&self) -> &str;

    /// Hand `data` to the link. Completion is reported later as
    /// [`TransportEvent::BytesWritten`].
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Discard buffered inbound and outbound data.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Next pending notification, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

#[cfg(feature = "native")]
pub use native::NativePort;
