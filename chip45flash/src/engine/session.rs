//! Programming session bookkeeping.

use std::collections::VecDeque;

use crate::protocol::MemoryType;
use crate::records::RecordSource;

/// State of one flash or EEPROM upload.
///
/// Created by [`Engine::program`](super::Engine::program) and dropped on
/// success, abort or stall timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgrammingSession {
    memory: MemoryType,
    pub(super) records: VecDeque<Vec<u8>>,
    total_bytes: usize,
    acknowledged: usize,
    last_progress: u8,
    streamed: usize,
    halted: bool,
}

impl ProgrammingSession {
    /// Copy the records of `source` into a new session targeting `memory`.
    pub fn new<R: RecordSource + ?Sized>(source: &R, memory: MemoryType) -> Self {
        Self {
            memory,
            records: source.lines().into(),
            total_bytes: source.total_size_bytes(),
            acknowledged: 0,
            last_progress: 0,
            streamed: 0,
            halted: false,
        }
    }

    /// Target memory.
    pub fn memory(&self) -> MemoryType {
        self.memory
    }

    /// Bytes covered by one page acknowledgment.
    pub fn chunk_size(&self) -> usize {
        self.memory.page_size()
    }

    /// Records not yet handed to the transport.
    pub fn remaining(&self) -> usize {
        self.records.len()
    }

    /// Whether records are still being handed to the transport.
    pub fn is_streaming(&self) -> bool {
        !self.halted && !self.records.is_empty()
    }

    /// Take the next record to send, unless streaming was halted.
    pub(super) fn next_record(&mut self) -> Option<Vec<u8>> {
        if self.halted {
            return None;
        }
        let record = self.records.pop_front()?;
        self.streamed += 1;
        Some(record)
    }

    /// Records taken for sending so far.
    pub fn streamed(&self) -> usize {
        self.streamed
    }

    /// Stop handing out records. Acknowledgments are still counted.
    pub(super) fn halt(&mut self) {
        self.halted = true;
    }

    /// Payload bytes of the whole session.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Page acknowledgments received so far.
    pub fn acknowledged(&self) -> usize {
        self.acknowledged
    }

    /// Page acknowledgments needed to cover [`total_bytes`](Self::total_bytes).
    pub fn expected_chunks(&self) -> usize {
        self.total_bytes.div_ceil(self.chunk_size())
    }

    /// Record one page acknowledgment and return the resulting progress.
    ///
    /// Progress is a percentage rounded to the nearest integer, clamped to
    /// 100 and never lower than a previously returned value.
    pub(super) fn acknowledge_page(&mut self) -> u8 {
        self.acknowledged += 1;

        let expected = self.expected_chunks();
        let percent = if expected == 0 {
            100
        } else {
            ((self.acknowledged * 100 + expected / 2) / expected).min(100) as u8
        };
        self.last_progress = self.last_progress.max(percent);
        self.last_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        lines: usize,
        bytes: usize,
    }

    impl RecordSource for Fixed {
        fn lines(&self) -> Vec<Vec<u8>> {
            (0..self.lines).map(|i| format!(":{i}\n").into_bytes()).collect()
        }

        fn total_size_bytes(&self) -> usize {
            self.bytes
        }
    }

    #[test]
    fn test_session_copies_records_in_order() {
        let session = ProgrammingSession::new(&Fixed { lines: 3, bytes: 48 }, MemoryType::Flash);
        assert_eq!(session.remaining(), 3);
        assert_eq!(session.records[0], b":0\n");
        assert_eq!(session.records[2], b":2\n");
        assert_eq!(session.acknowledged(), 0);
    }

    #[test]
    fn test_halted_session_keeps_remaining_records() {
        let mut session = ProgrammingSession::new(&Fixed { lines: 3, bytes: 48 }, MemoryType::Flash);
        assert!(session.is_streaming());
        assert_eq!(session.next_record().unwrap(), b":0\n");
        assert_eq!(session.streamed(), 1);

        session.halt();
        assert!(!session.is_streaming());
        assert_eq!(session.next_record(), None);
        assert_eq!(session.remaining(), 2);
    }

    #[test]
    fn test_expected_chunks_round_up() {
        let flash = ProgrammingSession::new(&Fixed { lines: 1, bytes: 300 }, MemoryType::Flash);
        assert_eq!(flash.chunk_size(), 128);
        assert_eq!(flash.expected_chunks(), 3);

        let eeprom = ProgrammingSession::new(&Fixed { lines: 1, bytes: 33 }, MemoryType::Eeprom);
        assert_eq!(eeprom.chunk_size(), 16);
        assert_eq!(eeprom.expected_chunks(), 3);
    }

    #[test]
    fn test_progress_reaches_exactly_100() {
        let mut session =
            ProgrammingSession::new(&Fixed { lines: 1, bytes: 300 }, MemoryType::Flash);
        assert_eq!(session.acknowledge_page(), 33);
        assert_eq!(session.acknowledge_page(), 67);
        assert_eq!(session.acknowledge_page(), 100);
        assert_eq!(session.acknowledged(), 3);
    }

    #[test]
    fn test_progress_clamped_on_extra_acks() {
        let mut session = ProgrammingSession::new(&Fixed { lines: 1, bytes: 16 }, MemoryType::Eeprom);
        assert_eq!(session.acknowledge_page(), 100);
        assert_eq!(session.acknowledge_page(), 100);
    }

    #[test]
    fn test_progress_with_zero_total() {
        let mut session = ProgrammingSession::new(&Fixed { lines: 1, bytes: 0 }, MemoryType::Flash);
        assert_eq!(session.expected_chunks(), 0);
        assert_eq!(session.acknowledge_page(), 100);
    }
}
