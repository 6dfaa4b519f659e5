//! chip45boot2 wire protocol.
//!
//! The bootloader speaks line-oriented ASCII. Every host command is a single
//! write; the device answers with short tokens:
//!
//! ```text
//! host                              device
//!  | -- "UUUU\n" (probe) ------------> |
//!  | <------------ "c45b2 ..." ------- |   version identification
//!  | <------- XOFF "-\n\r>" ---------- |   or: bootloader already active
//!  | -- "pf\n" / "pe\n" -------------> |   select flash / EEPROM
//!  | <------------ "pf+" / "pe+" ----- |
//!  | -- ":10000000..." --------------> |   one record per write
//!  | <------------ "." / "*" --------- |   line / page written
//!  | <------------ "\r" -------------- |   programming complete
//!  | <------------ "-" --------------- |   programming error
//!  | -- "g\n" -----------------------> |   leave bootloader
//!  | <------------ "g+" -------------- |
//! ```

use std::fmt;

/// Software flow control: resume transmission.
pub const XON: u8 = 0x11;

/// Software flow control: pause transmission.
pub const XOFF: u8 = 0x13;

/// Connection probe.
pub const PROBE: &[u8] = b"UUUU\n";

/// Identification token of a compatible bootloader.
pub const VERSION_TOKEN: &[u8] = b"c45b2";

/// Reply of a bootloader that was already running when probed.
pub const ACTIVE_MARKER: &[u8] = &[XOFF, b'-', b'\n', b'\r', b'>'];

/// Leave the bootloader and start the application.
pub const DISCONNECT: &[u8] = b"g\n";

/// Acknowledgment of [`DISCONNECT`].
pub const DISCONNECT_ACK: &[u8] = b"g+";

/// Number of leading reply bytes skipped when building the welcome banner.
const BANNER_SKIP: usize = 5;

/// Longest unterminated reply kept while waiting for `\r` or XON.
pub const MAX_REPLY_LEN: usize = 256;

/// Command the engine is currently talking to the device about.
///
/// It selects how the next inbound chunk is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Nothing outstanding.
    #[default]
    Idle,
    /// Connection probe.
    Connect,
    /// Memory selection (`pf`/`pe`).
    Program,
    /// One program record.
    DownloadLine,
    /// Leave the bootloader.
    Disconnect,
}

/// Memory region targeted by a programming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryType {
    /// Program flash.
    Flash,
    /// Data EEPROM.
    Eeprom,
}

impl MemoryType {
    /// Command selecting this memory for programming.
    pub fn select_command(self) -> &'static [u8] {
        match self {
            Self::Flash => b"pf\n",
            Self::Eeprom => b"pe\n",
        }
    }

    /// Reply accepting [`select_command`](Self::select_command).
    pub fn accept_reply(self) -> &'static str {
        match self {
            Self::Flash => "pf+",
            Self::Eeprom => "pe+",
        }
    }

    /// Bytes covered by one page write acknowledgment.
    pub fn page_size(self) -> usize {
        match self {
            Self::Flash => 128,
            Self::Eeprom => 16,
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flash => write!(f, "flash"),
            Self::Eeprom => write!(f, "EEPROM"),
        }
    }
}

/// Check if `data` contains `needle`.
pub fn contains(data: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && data.windows(needle.len()).any(|w| w == needle)
}

/// Whether `buffered` holds a complete reply.
///
/// The device ends every command reply with `\r`, or resumes with XON after
/// throttling. Record acknowledgments are single bytes and not framed.
pub fn is_reply_complete(buffered: &[u8]) -> bool {
    buffered.iter().any(|&b| b == b'\r' || b == XON)
}

/// How a reply to the connection probe identifies the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReply {
    /// A compatible bootloader announced its version.
    Version,
    /// The bootloader was already running.
    AlreadyActive,
    /// Neither token was found.
    Unknown,
}

/// Classify a reply to [`PROBE`].
pub fn classify_connect_reply(data: &[u8]) -> ConnectReply {
    if contains(data, VERSION_TOKEN) {
        ConnectReply::Version
    } else if contains(data, ACTIVE_MARKER) {
        ConnectReply::AlreadyActive
    } else {
        ConnectReply::Unknown
    }
}

/// Welcome banner built from a version reply.
pub fn welcome_banner(reply: &[u8]) -> String {
    let tail = reply.get(BANNER_SKIP..).unwrap_or_default();
    let text = String::from_utf8_lossy(tail);
    let simplified = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("===WELCOME TO Bootloader {simplified}===")
}

/// Check whether `reply` accepts the memory selection for `memory`.
///
/// Flow-control bytes are dropped and surrounding whitespace trimmed before
/// comparing.
pub fn accepts_program(reply: &[u8], memory: MemoryType) -> bool {
    let cleaned: Vec<u8> = reply.iter().copied().filter(|&b| b != XOFF).collect();
    String::from_utf8_lossy(&cleaned)
        .trim()
        .starts_with(memory.accept_reply())
}

/// Classification of a chunk received while records are streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadReply {
    /// The device reported a programming error (`-`).
    Error,
    /// Nothing but flow control or line feeds arrived.
    Silent,
    /// Programming finished (`\r` without acknowledgments).
    Finished,
    /// Bytes that mean nothing in this phase.
    Unrecognized,
    /// Line (`.`) and/or page (`*`) acknowledgments.
    Ack {
        /// Page writes acknowledged in this chunk.
        pages: usize,
        /// The chunk also carried the terminating `\r`.
        finished: bool,
    },
}

/// Classify a chunk received in the [`Command::DownloadLine`] phase.
///
/// Acknowledgments are single bytes, so one read may carry several of them.
/// Flow-control bytes and line feeds carry no meaning here and are skipped.
pub fn classify_download_reply(data: &[u8]) -> DownloadReply {
    let significant: Vec<u8> = data
        .iter()
        .copied()
        .filter(|&b| b != XON && b != XOFF && b != b'\n')
        .collect();
    let has = |b: u8| significant.contains(&b);

    if has(b'-') {
        return DownloadReply::Error;
    }
    if !has(b'.') && !has(b'*') {
        return if significant.is_empty() {
            DownloadReply::Silent
        } else if has(b'\r') {
            DownloadReply::Finished
        } else {
            DownloadReply::Unrecognized
        };
    }
    DownloadReply::Ack {
        pages: significant.iter().filter(|&&b| b == b'*').count(),
        finished: has(b'\r'),
    }
}

/// Render raw device bytes for log and event messages.
pub fn printable(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_type_commands() {
        assert_eq!(MemoryType::Flash.select_command(), b"pf\n");
        assert_eq!(MemoryType::Eeprom.select_command(), b"pe\n");
        assert_eq!(MemoryType::Flash.accept_reply(), "pf+");
        assert_eq!(MemoryType::Eeprom.accept_reply(), "pe+");
        assert_eq!(MemoryType::Flash.page_size(), 128);
        assert_eq!(MemoryType::Eeprom.page_size(), 16);
    }

    #[test]
    fn test_classify_connect_reply() {
        assert_eq!(
            classify_connect_reply(b"c45b2 v2.9Q\n\r>"),
            ConnectReply::Version
        );
        assert_eq!(
            classify_connect_reply(&[0x13, b'-', b'\n', b'\r', b'>']),
            ConnectReply::AlreadyActive
        );
        assert_eq!(classify_connect_reply(b"-\n\r>"), ConnectReply::Unknown);
        assert_eq!(classify_connect_reply(b"garbage"), ConnectReply::Unknown);
    }

    #[test]
    fn test_version_wins_over_active_marker() {
        let mut reply = b"c45b2 ".to_vec();
        reply.extend_from_slice(ACTIVE_MARKER);
        assert_eq!(classify_connect_reply(&reply), ConnectReply::Version);
    }

    #[test]
    fn test_welcome_banner_collapses_whitespace() {
        assert_eq!(
            welcome_banner(b"c45b2  v2.9Q\n\r  ATmega328P\n"),
            "===WELCOME TO Bootloader v2.9Q ATmega328P==="
        );
        assert_eq!(welcome_banner(b"c45"), "===WELCOME TO Bootloader ===");
    }

    #[test]
    fn test_accepts_program() {
        assert!(accepts_program(b"pf+\r\n", MemoryType::Flash));
        assert!(accepts_program(b"\x13pf+\x11\r", MemoryType::Flash));
        assert!(accepts_program(b"  pe+", MemoryType::Eeprom));
        assert!(!accepts_program(b"pe+", MemoryType::Flash));
        assert!(!accepts_program(b"pf-", MemoryType::Flash));
        assert!(!accepts_program(b"", MemoryType::Flash));
    }

    #[test]
    fn test_classify_download_reply() {
        assert_eq!(classify_download_reply(b"..-"), DownloadReply::Error);
        assert_eq!(classify_download_reply(b"*-\r"), DownloadReply::Error);
        assert_eq!(classify_download_reply(b""), DownloadReply::Silent);
        assert_eq!(classify_download_reply(b"\r"), DownloadReply::Finished);
        assert_eq!(classify_download_reply(b"?"), DownloadReply::Unrecognized);
        assert_eq!(
            classify_download_reply(b"..."),
            DownloadReply::Ack {
                pages: 0,
                finished: false
            }
        );
        assert_eq!(
            classify_download_reply(b"..*"),
            DownloadReply::Ack {
                pages: 1,
                finished: false
            }
        );
        assert_eq!(
            classify_download_reply(b"*\r"),
            DownloadReply::Ack {
                pages: 1,
                finished: true
            }
        );
    }

    #[test]
    fn test_merged_acks_count_every_page() {
        assert_eq!(
            classify_download_reply(b"........*........*........*"),
            DownloadReply::Ack {
                pages: 3,
                finished: false
            }
        );
        assert_eq!(
            classify_download_reply(b"\x13*\x11*\r"),
            DownloadReply::Ack {
                pages: 2,
                finished: true
            }
        );
    }

    #[test]
    fn test_flow_control_and_line_feeds_are_silent() {
        assert_eq!(classify_download_reply(b"\n"), DownloadReply::Silent);
        assert_eq!(classify_download_reply(&[XOFF, XON]), DownloadReply::Silent);
        assert_eq!(classify_download_reply(b"\r\n"), DownloadReply::Finished);
    }

    #[test]
    fn test_reply_complete_on_carriage_return_or_xon() {
        assert!(!is_reply_complete(b"c45"));
        assert!(!is_reply_complete(b""));
        assert!(is_reply_complete(b"c45b2 v2.9Q\n\r"));
        assert!(is_reply_complete(&[b'p', b'f', b'+', XON]));
        assert!(!is_reply_complete(&[XOFF, b'-', b'\n']));
    }

    #[test]
    fn test_contains() {
        assert!(contains(b"xxg+\r", DISCONNECT_ACK));
        assert!(!contains(b"g", DISCONNECT_ACK));
        assert!(!contains(b"abc", b""));
    }
}
