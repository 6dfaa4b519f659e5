//! Error types for chip45flash.

use std::io;
use thiserror::Error;

use crate::port::TransportFault;

/// Result type for chip45flash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for chip45flash operations.
///
/// Operations that fail synchronously return one of these. Failures detected
/// later by the engine are reported as events whose message is the `Display`
/// text of the matching variant.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The transport could not be opened.
    #[error("Could not open port {port}: {reason}")]
    TransportOpen {
        /// Port name/path.
        port: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// The bootloader never answered the connection probe.
    #[error("No initial reply from bootloader")]
    HandshakeTimeout,

    /// The bootloader answered with an unknown identification.
    #[error("Wrong bootloader version: {0}")]
    WrongBootloaderVersion(String),

    /// A write was requested while another one is still outstanding.
    #[error("Write rejected: a previous command is still pending")]
    WriteRejectedBusy,

    /// A write was requested with nothing to send.
    #[error("Write rejected: empty payload")]
    EmptyPayload,

    /// The device sent a reply that does not fit the current command.
    #[error("Unexpected reply from device: {0}")]
    UnexpectedDeviceReply(String),

    /// The device reported an error while programming.
    #[error("Something went wrong during programming")]
    ProgrammingAborted,

    /// The upload was dropped by a disconnect request.
    #[error("Upload cancelled: disconnected from bootloader")]
    UploadCancelled,

    /// No page acknowledgment arrived within the stall timeout.
    #[error("Upload timeout: probably less flash/eeprom size available than specified")]
    UploadStallTimeout,

    /// Read or write fault on the transport.
    #[error("Transport fault ({fault}): {message}")]
    TransportFault {
        /// Which side of the link failed.
        fault: TransportFault,
        /// Description reported by the transport.
        message: String,
    },

    /// The serial device disappeared.
    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    /// A connection or session is already in progress.
    #[error("Busy: {0}")]
    Busy(String),

    /// The operation requires an established bootloader connection.
    #[error("Not connected to a bootloader")]
    NotConnected,

    /// A program record could not be used.
    #[error("Invalid record at line {line}: {reason}")]
    InvalidRecord {
        /// 1-based line number in the source.
        line: usize,
        /// What is wrong with the record.
        reason: String,
    },

    /// Device not found.
    #[error("Device not found")]
    DeviceNotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_messages_match_protocol_text() {
        assert_eq!(
            Error::HandshakeTimeout.to_string(),
            "No initial reply from bootloader"
        );
        assert_eq!(
            Error::ProgrammingAborted.to_string(),
            "Something went wrong during programming"
        );
        assert_eq!(
            Error::UploadStallTimeout.to_string(),
            "Upload timeout: probably less flash/eeprom size available than specified"
        );
        assert_eq!(
            Error::WrongBootloaderVersion("xyz".into()).to_string(),
            "Wrong bootloader version: xyz"
        );
        assert_eq!(
            Error::UploadCancelled.to_string(),
            "Upload cancelled: disconnected from bootloader"
        );
        assert_eq!(
            Error::UnexpectedDeviceReply("?".into()).to_string(),
            "Unexpected reply from device: ?"
        );
    }

    #[test]
    fn test_invalid_record_display() {
        let err = Error::InvalidRecord {
            line: 3,
            reason: "bad checksum".into(),
        };
        assert_eq!(err.to_string(), "Invalid record at line 3: bad checksum");
    }
}
