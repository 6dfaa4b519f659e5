//! Intel HEX program records.
//!
//! The bootloader consumes Intel HEX lines verbatim, so records are validated
//! here but sent unchanged, one line per write, in file order.
//!
//! ```text
//! :10 0000 00 0C9434000C943E000C943E000C943E00 82
//!  |   |   |  |                                |
//!  |   |   |  data (byte count bytes)          checksum
//!  |   |   record type
//!  |   load offset
//!  byte count
//! ```

use std::fs;
use std::path::Path;
use std::str::FromStr;

use ihex::{ReaderError, Record};
use log::debug;

use crate::error::{Error, Result};

/// Largest data payload a single record can carry.
pub const MAX_RECORD_LEN: usize = 255;

/// Memory reachable through extended segment address records.
const MAX_SEGMENTED_SIZE: u32 = 0x10_0000;

/// Data bytes per record in generated images, as emitted by `avr-objcopy`.
pub const DEFAULT_RECORD_LEN: usize = 16;

/// Ordered program records for one programming session.
pub trait RecordSource {
    /// Records in write order, each terminated by `\n`.
    fn lines(&self) -> Vec<Vec<u8>>;

    /// Number of payload bytes the records write to the device.
    fn total_size_bytes(&self) -> usize;
}

/// Validated Intel HEX file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexRecords {
    records: Vec<String>,
    total_size_bytes: usize,
    address_range: Option<(u32, u32)>,
}

impl HexRecords {
    /// Load and validate an Intel HEX file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading HEX records from: {}", path.display());

        let text = fs::read_to_string(path)?;
        text.parse()
    }

    /// Records filling `size_bytes` of memory with `0xFF`, followed by an
    /// end-of-file record.
    ///
    /// Addresses beyond 64 KiB are reached through extended segment address
    /// records.
    pub fn erase_fill(size_bytes: usize, record_len: usize) -> Result<Self> {
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(Error::InvalidRecord {
                line: 0,
                reason: format!("record length must be 1..={MAX_RECORD_LEN}, got {record_len}"),
            });
        }
        let size = u32::try_from(size_bytes)
            .ok()
            .filter(|&s| s <= MAX_SEGMENTED_SIZE)
            .ok_or_else(|| Error::InvalidRecord {
                line: 0,
                reason: format!("erase size {size_bytes} exceeds the 1 MiB address space"),
            })?;

        let mut records = Vec::new();
        let mut segment = 0u32;
        let mut address = 0u32;
        while address < size {
            let upper = address >> 16;
            if upper != segment {
                segment = upper;
                // Segment base is in 16-byte paragraphs.
                let paragraph = (segment << 12) as u16;
                records.push(encode(&Record::ExtendedSegmentAddress(paragraph))?);
            }
            // Records never straddle a 64 KiB boundary.
            let in_segment = 0x1_0000 - (address & 0xFFFF);
            let len = (record_len as u32).min(size - address).min(in_segment);
            records.push(encode(&Record::Data {
                offset: (address & 0xFFFF) as u16,
                value: vec![0xFF; len as usize],
            })?);
            address += len;
        }
        records.push(encode(&Record::EndOfFile)?);

        let address_range = (size > 0).then(|| (0, size - 1));
        Ok(Self {
            records,
            total_size_bytes: size_bytes,
            address_range,
        })
    }

    /// Number of records, including address and end-of-file records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records as text, without line terminators.
    pub fn records(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(String::as_str)
    }

    /// Lowest and highest absolute address written by data records.
    pub fn address_range(&self) -> Option<(u32, u32)> {
        self.address_range
    }
}

impl FromStr for HexRecords {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let mut parsed = Self::default();
        let mut base = 0u32;
        let mut seen_eof = false;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let record = raw.trim();
            if record.is_empty() {
                continue;
            }
            if seen_eof {
                return Err(invalid(line, "record after end-of-file record"));
            }

            let parsed_record =
                Record::from_record_string(record).map_err(|e| invalid(line, describe(&e)))?;

            match parsed_record {
                Record::Data { offset, value } if !value.is_empty() => {
                    let start = base.wrapping_add(u32::from(offset));
                    let end = start.wrapping_add(value.len() as u32 - 1);
                    parsed.address_range = Some(match parsed.address_range {
                        Some((lo, hi)) => (lo.min(start), hi.max(end)),
                        None => (start, end),
                    });
                    parsed.total_size_bytes += value.len();
                },
                Record::EndOfFile => seen_eof = true,
                Record::ExtendedSegmentAddress(segment) => base = u32::from(segment) << 4,
                Record::ExtendedLinearAddress(upper) => base = u32::from(upper) << 16,
                _ => {},
            }
            parsed.records.push(record.to_owned());
        }

        debug!(
            "Parsed {} HEX records, {} data bytes",
            parsed.records.len(),
            parsed.total_size_bytes
        );
        Ok(parsed)
    }
}

impl RecordSource for HexRecords {
    fn lines(&self) -> Vec<Vec<u8>> {
        self.records
            .iter()
            .map(|r| {
                let mut line = Vec::with_capacity(r.len() + 1);
                line.extend_from_slice(r.as_bytes());
                line.push(b'\n');
                line
            })
            .collect()
    }

    fn total_size_bytes(&self) -> usize {
        self.total_size_bytes
    }
}

fn invalid(line: usize, reason: impl Into<String>) -> Error {
    Error::InvalidRecord {
        line,
        reason: reason.into(),
    }
}

/// Short reason for a rejected record.
fn describe(err: &ReaderError) -> String {
    match err {
        ReaderError::ChecksumMismatch(..) => "bad checksum".to_string(),
        other => other.to_string(),
    }
}

/// Encode one record.
fn encode(record: &Record) -> Result<String> {
    record.to_record_string().map_err(|e| invalid(0, e.to_string()))
}
