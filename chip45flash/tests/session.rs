//! End-to-end sessions against a simulated chip45boot2 device.

use std::collections::VecDeque;
use std::io::Write as _;
use std::time::{Duration, Instant};

use chip45flash::{
    ConnectionState, Engine, Event, HexRecords, MemoryType, RecordSource, Result, SerialConfig,
    Transport, TransportEvent,
};

/// Answers host commands the way the bootloader does.
#[derive(Default)]
struct SimulatedBootloader {
    open: bool,
    name: String,
    memory: Option<MemoryType>,
    page_fill: usize,
    /// Stop answering after this many page acknowledgments.
    stall_after_pages: Option<usize>,
    /// Deliver every reply in reads of at most this many bytes.
    fragment: Option<usize>,
    /// Hold record acknowledgments and deliver them in one read per this
    /// many records.
    merge_every: Option<usize>,
    /// Time each write blocks the caller for.
    write_delay: Duration,
    /// Time spent blocked in writes so far.
    elapsed: Duration,
    /// Deliver the end-of-upload reply one poll after it was produced.
    late_final_reply: bool,
    late: Option<Vec<u8>>,
    held: Vec<u8>,
    pages: usize,
    records_received: usize,
    events: VecDeque<TransportEvent>,
}

impl SimulatedBootloader {
    fn answer(&mut self, reply: &[u8]) {
        let piece = self.fragment.unwrap_or(reply.len()).max(1);
        for chunk in reply.chunks(piece) {
            self.events.push_back(TransportEvent::ReadyRead(chunk.to_vec()));
        }
    }

    fn acknowledge(&mut self, reply: &[u8]) {
        match self.merge_every {
            None => self.answer(reply),
            Some(every) => {
                self.held.extend_from_slice(reply);
                if self.records_received % every == 0 || reply.contains(&b'\r') {
                    let held = std::mem::take(&mut self.held);
                    self.answer(&held);
                }
            },
        }
    }

    fn finish(&mut self, reply: &[u8]) {
        if self.late_final_reply {
            self.late = Some(reply.to_vec());
        } else {
            self.acknowledge(reply);
        }
    }

    fn on_record(&mut self, line: &[u8]) {
        self.records_received += 1;
        if self.stall_after_pages.is_some_and(|n| self.pages >= n) {
            return;
        }

        let text = String::from_utf8_lossy(line);
        let record = text.trim();
        let page_size = self.memory.map_or(128, MemoryType::page_size);

        match &record[7..9] {
            "00" => {
                let count = usize::from_str_radix(&record[1..3], 16).unwrap();
                self.page_fill += count;
                if self.page_fill >= page_size {
                    self.page_fill -= page_size;
                    self.pages += 1;
                    self.acknowledge(b"*");
                } else {
                    self.acknowledge(b".");
                }
            },
            "01" if self.page_fill > 0 => {
                self.page_fill = 0;
                self.pages += 1;
                self.finish(b"*\r");
            },
            "01" => self.finish(b"\r"),
            _ => self.acknowledge(b"."),
        }
    }
}

impl Transport for SimulatedBootloader {
    fn open(&mut self, config: &SerialConfig) -> Result<()> {
        self.name.clone_from(&config.port_name);
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.elapsed += self.write_delay;
        self.events.push_back(TransportEvent::BytesWritten(data.len()));
        match data {
            b"UUUU\n" => self.answer(b"c45b2 v2.9Q \n\r>"),
            b"pf\n" => {
                self.memory = Some(MemoryType::Flash);
                self.answer(b"\x13pf+\r\n");
            },
            b"pe\n" => {
                self.memory = Some(MemoryType::Eeprom);
                self.answer(b"pe+\r\n");
            },
            b"g\n" => self.answer(b"g+\r\n"),
            line if line.starts_with(b":") => self.on_record(line),
            _ => {},
        }
        Ok(data.len())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        if let Some(reply) = self.late.take() {
            self.answer(&reply);
        }
        None
    }
}

const MS: Duration = Duration::from_millis(1);

/// Poll every 10ms from `start` until `until` returns true for an event.
///
/// Time the simulated device spent blocking writes is added to the clock.
fn run_until(
    engine: &mut Engine<SimulatedBootloader>,
    start: Instant,
    limit: Duration,
    until: impl Fn(&Event) -> bool,
) -> Vec<Event> {
    let mut seen = Vec::new();
    let mut elapsed = Duration::ZERO;
    while elapsed <= limit {
        engine.poll(start + elapsed + engine.transport().elapsed);
        while let Some(event) = engine.next_event() {
            let done = until(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
        elapsed += MS * 10;
    }
    panic!("condition not reached within {limit:?}, events: {seen:?}");
}

fn connect_events(engine: &mut Engine<SimulatedBootloader>, t0: Instant) -> Vec<Event> {
    engine.connect("/dev/ttySIM", 115200, MS * 2000, t0).unwrap();
    run_until(engine, t0, MS * 500, |e| matches!(e, Event::Connected { .. }))
}

fn connect(engine: &mut Engine<SimulatedBootloader>, t0: Instant) {
    let events = connect_events(engine, t0);
    assert_eq!(
        events,
        vec![Event::Connected {
            connected: true,
            message: "===WELCOME TO Bootloader v2.9Q >===".into(),
        }]
    );
}

fn progress(events: &[Event]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::UploadProgress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

fn write_hex(records: &[&str]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for record in records {
        writeln!(file, "{record}").unwrap();
    }
    file
}

#[test]
fn test_flash_hex_file() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 16 data records of 16 bytes: two full flash pages.
    let image = HexRecords::erase_fill(256, 16).unwrap();
    let lines: Vec<&str> = image.records().collect();
    let file = write_hex(&lines);

    let hex = HexRecords::from_file(file.path()).unwrap();
    assert_eq!(hex.total_size_bytes(), 256);
    assert_eq!(hex.len(), 17);

    let t0 = Instant::now();
    let mut engine = Engine::new(SimulatedBootloader::default());
    connect(&mut engine, t0);

    engine.program(&hex, MemoryType::Flash).unwrap();
    let events = run_until(&mut engine, t0 + MS * 500, MS * 500, |e| {
        matches!(e, Event::FirmwareUploaded { .. })
    });

    assert_eq!(progress(&events), vec![50, 100]);
    assert_eq!(
        events.last(),
        Some(&Event::FirmwareUploaded {
            success: true,
            message: String::new(),
        })
    );
    assert_eq!(engine.transport().records_received, 17);
    assert_eq!(engine.acknowledged_chunks(), 0);
}

#[test]
fn test_erase_eeprom_with_partial_last_page() {
    let t0 = Instant::now();
    let mut engine = Engine::new(SimulatedBootloader::default());
    connect(&mut engine, t0);

    engine.erase(MemoryType::Eeprom, 40).unwrap();
    let events = run_until(&mut engine, t0 + MS * 500, MS * 500, |e| {
        matches!(e, Event::FirmwareUploaded { .. })
    });

    let steps = progress(&events);
    assert_eq!(steps, vec![33, 67, 100]);
    assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    assert!(matches!(
        events.last(),
        Some(Event::FirmwareUploaded { success: true, .. })
    ));
}

#[test]
fn test_silent_device_stalls_upload() {
    let t0 = Instant::now();
    let transport = SimulatedBootloader {
        stall_after_pages: Some(1),
        ..Default::default()
    };
    let mut engine = Engine::new(transport);
    connect(&mut engine, t0);

    engine.erase(MemoryType::Flash, 1024).unwrap();
    let start = t0 + MS * 500;
    let events = run_until(&mut engine, start, MS * 3000, |e| {
        matches!(e, Event::FirmwareUploaded { .. })
    });

    assert_eq!(progress(&events), vec![13]);
    assert_eq!(
        events.last(),
        Some(&Event::FirmwareUploaded {
            success: false,
            message: "Upload timeout: probably less flash/eeprom size available than specified"
                .into(),
        })
    );
    assert!(engine.session().is_none());
    assert!(engine.is_connected());
}

#[test]
fn test_disconnect_after_upload_closes_port() {
    let t0 = Instant::now();
    let mut engine = Engine::new(SimulatedBootloader::default());
    connect(&mut engine, t0);

    engine.disconnect().unwrap();
    assert_eq!(engine.state(), ConnectionState::Disconnected);
    assert_eq!(
        engine.next_event(),
        Some(Event::Connected {
            connected: false,
            message: "Disconnected from /dev/ttySIM".into(),
        })
    );
    assert!(engine.transport().is_open());

    engine.poll(t0 + MS * 600);
    assert!(!engine.transport().is_open());

    // The engine is ready for a new session.
    connect(&mut engine, t0 + MS * 1000);
}

#[test]
fn test_fragmented_replies() {
    let transport = SimulatedBootloader {
        fragment: Some(2),
        ..Default::default()
    };
    let t0 = Instant::now();
    let mut engine = Engine::new(transport);
    let events = connect_events(&mut engine, t0);
    assert!(matches!(
        events.as_slice(),
        [Event::Connected { connected: true, message }] if message.starts_with("===WELCOME")
    ));

    engine.erase(MemoryType::Flash, 256).unwrap();
    let events = run_until(&mut engine, t0 + MS * 500, MS * 1000, |e| {
        matches!(e, Event::FirmwareUploaded { .. })
    });
    assert_eq!(progress(&events), vec![50, 100]);
    assert!(matches!(
        events.last(),
        Some(Event::FirmwareUploaded { success: true, .. })
    ));

    engine.disconnect().unwrap();
    engine.poll(t0 + MS * 2000);
    engine.poll(t0 + MS * 2010);
    assert!(!engine.transport().is_open());
}

#[test]
fn test_merged_acknowledgments() {
    let transport = SimulatedBootloader {
        merge_every: Some(4),
        ..Default::default()
    };
    let t0 = Instant::now();
    let mut engine = Engine::new(transport);
    connect(&mut engine, t0);

    // Four one-page records, acknowledged in a single read.
    engine.erase(MemoryType::Eeprom, 64).unwrap();
    let events = run_until(&mut engine, t0 + MS * 500, MS * 500, |e| {
        matches!(e, Event::FirmwareUploaded { .. })
    });

    assert_eq!(progress(&events), vec![25, 50, 75, 100]);
    assert_eq!(
        events.last(),
        Some(&Event::FirmwareUploaded {
            success: true,
            message: String::new(),
        })
    );
}

#[test]
fn test_slow_link_does_not_stall_upload() {
    let transport = SimulatedBootloader {
        write_delay: MS * 30,
        late_final_reply: true,
        ..Default::default()
    };
    let t0 = Instant::now();
    let mut engine = Engine::new(transport);
    connect(&mut engine, t0);

    engine.erase(MemoryType::Flash, 1024).unwrap();
    let events = run_until(&mut engine, t0 + MS * 500, MS * 2000, |e| {
        matches!(e, Event::FirmwareUploaded { .. })
    });

    assert!(engine.transport().elapsed > MS * 1000);
    assert_eq!(progress(&events), vec![13, 25, 38, 50, 63, 75, 88, 100]);
    assert_eq!(
        events.last(),
        Some(&Event::FirmwareUploaded {
            success: true,
            message: String::new(),
        })
    );
}
