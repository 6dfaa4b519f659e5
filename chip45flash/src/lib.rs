//! # chip45flash
//!
//! A library for programming AVR microcontrollers through the chip45boot2
//! serial bootloader.
//!
//! This crate provides:
//!
//! - a non-blocking protocol engine driving the bootloader handshake, flash
//!   and EEPROM programming, and disconnect
//! - Intel HEX record loading and erase-fill generation
//! - a serial transport built on the `serialport` crate
//! - serial port discovery for common USB-UART bridges
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for events and data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::{Duration, Instant};
//! use chip45flash::{Engine, Event, NativePort};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new(NativePort::new());
//!     engine.connect("/dev/ttyUSB0", 115200, Duration::from_secs(2), Instant::now())?;
//!
//!     loop {
//!         engine.poll(Instant::now());
//!         if let Some(Event::Connected { connected, message }) = engine.next_event() {
//!             println!("{message}");
//!             if connected {
//!                 engine.disconnect()?;
//!             }
//!             return Ok(());
//!         }
//!         std::thread::sleep(Duration::from_millis(5));
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod engine;
pub mod error;
pub mod port;
pub mod protocol;
pub mod records;
pub mod timer;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, format_port_list},
    engine::{ConnectionState, Engine, Event, PendingWrite, ProgrammingSession},
    error::{Error, Result},
    port::{SerialConfig, Transport, TransportEvent, TransportFault},
    protocol::{Command, MemoryType},
    records::{HexRecords, RecordSource},
};
