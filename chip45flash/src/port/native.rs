//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the transport for native platforms (Linux, macOS,
//! Windows, FreeBSD, etc.).

use {
    crate::{
        error::{Error, Result},
        port::{
            DataBits, FlowControl, Parity, SerialConfig, StopBits, Transport, TransportEvent,
            TransportFault,
        },
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
    },
};

/// Largest chunk pulled from the driver in one poll.
const MAX_READ_CHUNK: usize = 4096;

/// Native serial port transport.
///
/// Writes are performed synchronously (bounded by the configured timeout) and
/// their completion is queued as a [`TransportEvent::BytesWritten`] for the
/// next poll, so the engine sees the same notification order it would get
/// from an asynchronous driver.
#[derive(Default)]
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    pending: VecDeque<TransportEvent>,
}

impl NativePort {
    /// Create a closed port.
    pub fn new() -> Self {
        Self::default()
    }

    fn fault(&mut self, fault: TransportFault, message: String) -> TransportEvent {
        debug!("Transport fault on {} ({fault}): {message}", self.name);
        if fault == TransportFault::DeviceRemoved {
            self.port.take();
        }
        TransportEvent::Fault { fault, message }
    }
}

/// Whether an I/O error means the device itself is gone.
fn is_removal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

impl Transport for NativePort {
    fn open(&mut self, config: &SerialConfig) -> Result<()> {
        self.name.clone_from(&config.port_name);
        self.pending.clear();

        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(config.flow_control.into())
            .open()
            .map_err(|e| Error::TransportOpen {
                port: config.port_name.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            "Opened {} at {} baud ({:?}, {:?}, {:?}, {:?})",
            config.port_name,
            config.baud_rate,
            config.data_bits,
            config.parity,
            config.stop_bits,
            config.flow_control
        );
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed {}", self.name);
        }
        self.pending.clear();
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::TransportFault {
                fault: TransportFault::Write,
                message: "port closed".into(),
            });
        };

        match port.write_all(data).and_then(|()| port.flush()) {
            Ok(()) => {
                trace!("Wrote {} bytes to {}", data.len(), self.name);
                self.pending.push_back(TransportEvent::BytesWritten(data.len()));
                Ok(data.len())
            },
            Err(e) => {
                let message = e.to_string();
                if is_removal(&e) {
                    let event = self.fault(TransportFault::DeviceRemoved, message.clone());
                    self.pending.push_back(event);
                }
                Err(Error::TransportFault {
                    fault: TransportFault::Write,
                    message,
                })
            },
        }
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        let port = self.port.as_mut()?;
        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                let fault = if e.kind() == serialport::ErrorKind::NoDevice {
                    TransportFault::DeviceRemoved
                } else {
                    TransportFault::Read
                };
                return Some(self.fault(fault, e.to_string()));
            },
        };
        if available == 0 {
            return None;
        }

        let mut buf = vec![0u8; available.min(MAX_READ_CHUNK)];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                trace!("Read {n} bytes from {}", self.name);
                Some(TransportEvent::ReadyRead(buf))
            },
            Err(e) if e.kind() == io::ErrorKind::TimedOut => None,
            Err(e) => {
                let fault = if is_removal(&e) {
                    TransportFault::DeviceRemoved
                } else {
                    TransportFault::Read
                };
                Some(self.fault(fault, e.to_string()))
            },
        }
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => Self::Five,
            DataBits::Six => Self::Six,
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_port_is_closed() {
        let mut port = NativePort::new();
        assert!(!port.is_open());
        assert!(port.poll_event().is_none());
        assert!(port.write(b"UUUU\n").is_err());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let mut port = NativePort::new();
        let config = SerialConfig::bootloader("/dev/chip45flash-does-not-exist", 19200);
        let err = port.open(&config).unwrap_err();
        assert!(matches!(err, Error::TransportOpen { .. }));
        assert!(!port.is_open());
        assert_eq!(port.name(), "/dev/chip45flash-does-not-exist");
    }

    #[test]
    fn test_line_setting_conversions() {
        assert_eq!(
            serialport::StopBits::from(StopBits::Two),
            serialport::StopBits::Two
        );
        assert_eq!(
            serialport::FlowControl::from(FlowControl::Software),
            serialport::FlowControl::Software
        );
        assert_eq!(serialport::Parity::from(Parity::None), serialport::Parity::None);
        assert_eq!(
            serialport::DataBits::from(DataBits::Eight),
            serialport::DataBits::Eight
        );
    }

    #[test]
    fn test_removal_classification() {
        assert!(is_removal(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_removal(&io::Error::from(io::ErrorKind::TimedOut)));
    }
}
