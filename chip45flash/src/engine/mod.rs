//! chip45boot2 protocol engine.
//!
//! The engine is single-threaded and never waits. Operations such as
//! [`Engine::connect`] and [`Engine::program`] issue a write and return; the
//! caller then drives the engine by calling [`Engine::poll`] with the current
//! time, which drains transport notifications and fires due timers. Outcomes
//! are queued as [`Event`]s and retrieved with [`Engine::next_event`].
//!
//! ```text
//!   Disconnected --connect--> Connecting --"c45b2"/marker--> Connected
//!        ^                        |                              |
//!        |                     timeout                          |
//!        +------------------------+---------disconnect----------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::{Duration, Instant};
//! use chip45flash::{Engine, Event, HexRecords, MemoryType, NativePort};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new(NativePort::new());
//!     engine.connect("/dev/ttyUSB0", 115200, Duration::from_secs(2), Instant::now())?;
//!
//!     let hex = HexRecords::from_file("firmware.hex")?;
//!     loop {
//!         engine.poll(Instant::now());
//!         while let Some(event) = engine.next_event() {
//!             match event {
//!                 Event::Connected { connected: true, .. } => {
//!                     engine.program(&hex, MemoryType::Flash)?;
//!                 },
//!                 Event::UploadProgress(percent) => println!("{percent}%"),
//!                 Event::FirmwareUploaded { .. } => {
//!                     engine.disconnect()?;
//!                     return Ok(());
//!                 },
//!                 _ => {},
//!             }
//!         }
//!         std::thread::sleep(Duration::from_millis(5));
//!     }
//! }
//! ```

mod dispatch;
mod parser;
mod session;


pub use dispatch::PendingWrite;
pub use session::ProgrammingSession;

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::{SerialConfig, Transport, TransportEvent, TransportFault};
use crate::protocol::{Command, DISCONNECT, MemoryType, PROBE, printable};
use crate::records::{DEFAULT_RECORD_LEN, HexRecords, RecordSource};
use crate::timer::{Interval, Watchdog};

/// Period of the connection probe.
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest gap allowed between two page acknowledgments.
pub const UPLOAD_STALL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timeout of a single transport write.
///
/// The device throttles record lines with XON/XOFF while it writes a page.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Event {
    /// The connection state changed.
    Connected {
        /// Whether the bootloader is now connected.
        connected: bool,
        /// Banner, warning or failure text.
        message: String,
    },
    /// Percentage of pages acknowledged in the running session.
    UploadProgress(u8),
    /// A programming session ended.
    FirmwareUploaded {
        /// Whether the device confirmed the upload.
        success: bool,
        /// Failure text; empty on success.
        message: String,
    },
    /// The transport reported a fault.
    TransportFault {
        /// Fault kind.
        fault: TransportFault,
        /// Description from the transport.
        message: String,
    },
}

/// Link state derived from the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake running and no bootloader connected.
    Disconnected,
    /// Probing for the bootloader.
    Connecting,
    /// The bootloader answered the probe.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Protocol engine driving one chip45boot2 bootloader over `T`.
pub struct Engine<T: Transport> {
    transport: T,
    current_command: Command,
    current_write_command: Command,
    pending: PendingWrite,
    reply: Vec<u8>,
    session: Option<ProgrammingSession>,
    connected: bool,
    active_bootloader_already: bool,
    handshake: Interval,
    handshake_started: Option<Instant>,
    connect_timeout: Duration,
    foreign_reply: Option<String>,
    watchdog: Watchdog,
    events: VecDeque<Event>,
}

impl<T: Transport> Engine<T> {
    /// Create an idle engine owning `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            current_command: Command::Idle,
            current_write_command: Command::Idle,
            pending: PendingWrite::default(),
            reply: Vec::new(),
            session: None,
            connected: false,
            active_bootloader_already: false,
            handshake: Interval::new(HANDSHAKE_POLL_INTERVAL),
            handshake_started: None,
            connect_timeout: Duration::ZERO,
            foreign_reply: None,
            watchdog: Watchdog::new(UPLOAD_STALL_TIMEOUT),
            events: VecDeque::new(),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the engine and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Open `port` and start probing for the bootloader.
    ///
    /// A probe is sent every [`HANDSHAKE_POLL_INTERVAL`] until the device
    /// answers or `timeout` elapses; the outcome is reported as
    /// [`Event::Connected`]. A reply from some other device does not end the
    /// attempt, but it is named in the failure if no bootloader answers.
    pub fn connect(
        &mut self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
        now: Instant,
    ) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(Error::Busy(format!("already {state}")));
        }
        // Still waiting for a disconnect acknowledgment.
        if self.transport.is_open() {
            self.transport.close();
        }

        let config = SerialConfig::bootloader(port, baud_rate).with_timeout(WRITE_TIMEOUT);
        self.transport.open(&config)?;

        self.reset();
        self.connect_timeout = timeout;
        self.handshake.start(now);
        info!("Connecting to {port} at {baud_rate} baud...");
        Ok(())
    }

    /// Program `records` into `memory`.
    ///
    /// Once the device accepts the memory selection, one record is sent per
    /// [`poll`](Self::poll). Progress and the outcome are reported as
    /// [`Event::UploadProgress`] and [`Event::FirmwareUploaded`].
    pub fn program<R: RecordSource + ?Sized>(
        &mut self,
        records: &R,
        memory: MemoryType,
    ) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        if self.session.is_some() {
            return Err(Error::Busy("a programming session is already running".into()));
        }

        let session = ProgrammingSession::new(records, memory);
        if session.remaining() == 0 {
            return Err(Error::EmptyPayload);
        }
        info!(
            "Uploading {} records ({} bytes) to {memory}",
            session.remaining(),
            session.total_bytes()
        );
        self.prepare_command_and_write(Command::Program, memory.select_command(), Some(session))
    }

    /// Fill `size_bytes` of `memory` with `0xFF`.
    pub fn erase(&mut self, memory: MemoryType, size_bytes: usize) -> Result<()> {
        let records = HexRecords::erase_fill(size_bytes, DEFAULT_RECORD_LEN)?;
        info!("Erasing {size_bytes} bytes of {memory}");
        self.program(&records, memory)
    }

    /// Ask the bootloader to start the application.
    ///
    /// The engine reports itself disconnected immediately; the transport is
    /// closed once the device acknowledges. A running session ends with a
    /// failed [`Event::FirmwareUploaded`].
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.transport.is_open() {
            return Err(Error::NotConnected);
        }
        let port = self.transport.name().to_owned();

        self.stop_handshake();
        self.watchdog.stop();
        if let Some(session) = self.session.take() {
            warn!(
                "{memory} upload cancelled after {} page acks",
                session.acknowledged(),
                memory = session.memory()
            );
            self.emit(Event::FirmwareUploaded {
                success: false,
                message: Error::UploadCancelled.to_string(),
            });
        }
        // A leftover probe must not block the disconnect request.
        self.clear_pending_write();

        let result = self.prepare_command_and_write(Command::Disconnect, DISCONNECT, None);
        self.connected = false;
        self.active_bootloader_already = false;
        info!("Disconnected from {port}");
        self.emit(Event::Connected {
            connected: false,
            message: format!("Disconnected from {port}"),
        });
        result
    }

    /// Process transport notifications and timers due at `now`, then send
    /// the next record of a running upload.
    ///
    /// Inbound bytes are handled before the record is written, so
    /// acknowledgments always arm the watchdog with a current `now`.
    pub fn poll(&mut self, now: Instant) {
        while let Some(event) = self.transport.poll_event() {
            match event {
                TransportEvent::ReadyRead(data) => self.handle_ready_read(&data, now),
                TransportEvent::BytesWritten(count) => self.handle_bytes_written(count),
                TransportEvent::Fault { fault, message } => self.handle_fault(fault, message),
            }
        }

        if self.current_command == Command::DownloadLine {
            self.stream_next_record();
        }

        if self.handshake.due(now) {
            self.on_handshake_tick(now);
        }
        if self.watchdog.expired(now) {
            self.on_upload_stall();
        }
    }

    /// Next queued event, oldest first.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        if self.connected {
            ConnectionState::Connected
        } else if self.handshake.is_active() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Whether the bootloader answered the probe.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the device was already in the bootloader when probed, in which
    /// case its version could not be checked.
    pub fn is_bootloader_already_active(&self) -> bool {
        self.active_bootloader_already
    }

    /// Command the next inbound chunk is interpreted for.
    pub fn current_command(&self) -> Command {
        self.current_command
    }

    /// Running programming session.
    pub fn session(&self) -> Option<&ProgrammingSession> {
        self.session.as_ref()
    }

    /// Page acknowledgments counted in the running session.
    pub fn acknowledged_chunks(&self) -> usize {
        self.session.as_ref().map_or(0, ProgrammingSession::acknowledged)
    }

    /// Handle a fault reported by the transport.
    pub fn handle_fault(&mut self, fault: TransportFault, message: String) {
        match fault {
            TransportFault::Read | TransportFault::Write => {
                warn!(
                    "An I/O error occurred on {} ({fault}): {message}",
                    self.transport.name()
                );
                self.clear_pending_write();
                self.emit(Event::TransportFault { fault, message });
            },
            TransportFault::DeviceRemoved => self.hard_reset(message),
        }
    }

    fn on_handshake_tick(&mut self, now: Instant) {
        let started = *self.handshake_started.get_or_insert(now);

        if self.connected {
            self.stop_handshake();
            return;
        }
        if now.duration_since(started) >= self.connect_timeout {
            let unterminated = std::mem::take(&mut self.reply);
            let error = match self.foreign_reply.take() {
                Some(reply) => Error::WrongBootloaderVersion(reply),
                None if !unterminated.is_empty() => {
                    Error::WrongBootloaderVersion(printable(&unterminated))
                },
                None => Error::HandshakeTimeout,
            };
            warn!("Giving up on {}: {error}", self.transport.name());
            self.stop_handshake();
            self.clear_pending_write();
            self.current_command = Command::Idle;
            self.transport.close();
            self.emit(Event::Connected {
                connected: false,
                message: error.to_string(),
            });
            return;
        }

        if let Err(e) = self.prepare_command_and_write(Command::Connect, PROBE, None) {
            debug!("Probe skipped: {e}");
        }
    }

    fn on_upload_stall(&mut self) {
        warn!(
            "No page acknowledgment within {} ms",
            UPLOAD_STALL_TIMEOUT.as_millis()
        );
        self.finish_upload(false, Error::UploadStallTimeout.to_string());
    }

    /// Drop everything after the device disappeared.
    fn hard_reset(&mut self, message: String) {
        warn!("Device on {} removed: {message}", self.transport.name());
        let had_session = self.session.is_some();
        let was_linked = self.state() != ConnectionState::Disconnected;

        self.transport.close();
        self.reset();

        self.emit(Event::TransportFault {
            fault: TransportFault::DeviceRemoved,
            message: message.clone(),
        });
        let text = Error::DeviceRemoved(message).to_string();
        if had_session {
            self.emit(Event::FirmwareUploaded {
                success: false,
                message: text.clone(),
            });
        }
        if was_linked {
            self.emit(Event::Connected {
                connected: false,
                message: text,
            });
        }
    }

    /// Return every flag, counter and timer to its initial value.
    fn reset(&mut self) {
        self.stop_handshake();
        self.watchdog.stop();
        self.session = None;
        self.clear_pending_write();
        self.reply.clear();
        self.foreign_reply = None;
        self.current_command = Command::Idle;
        self.connected = false;
        self.active_bootloader_already = false;
    }

    fn stop_handshake(&mut self) {
        self.handshake.stop();
        self.handshake_started = None;
    }

    fn emit(&mut self, event: Event) {
        debug!("Event: {event:?}");
        self.events.push_back(event);
    }
}

impl<T: Transport> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("port", &self.transport.name())
            .field("state", &self.state())
            .field("current_command", &self.current_command)
            .field("current_write_command", &self.current_write_command)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
