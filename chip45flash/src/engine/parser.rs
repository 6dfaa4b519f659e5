//! Response parser: interprets inbound bytes by the current command.

use std::time::Instant;

use log::{debug, info, trace, warn};

use super::{Engine, Event, ProgrammingSession};
use crate::error::Error;
use crate::port::Transport;
use crate::protocol::{
    self, Command, ConnectReply, DISCONNECT_ACK, DownloadReply, VERSION_TOKEN, printable,
};

/// Reported when the device was already in the bootloader when probed.
const ALREADY_ACTIVE_WARNING: &str =
    "Warning: bootloader was already active - could not check for compatible version";

impl<T: Transport> Engine<T> {
    /// Handle one chunk of inbound bytes received at `now`.
    ///
    /// Record acknowledgments are interpreted as they arrive. Replies to the
    /// other commands are collected until `\r` or XON and then parsed whole.
    pub fn handle_ready_read(&mut self, data: &[u8], now: Instant) {
        trace!("<- {:?} ({:?})", printable(data), self.current_command);

        let command = self.current_command;
        if command == Command::DownloadLine {
            self.parse_download_line(data, now);
            return;
        }
        if command == Command::Idle {
            debug!("Ignoring {} bytes while idle", data.len());
            return;
        }

        self.reply.extend_from_slice(data);
        if !protocol::is_reply_complete(&self.reply) {
            if self.reply.len() < protocol::MAX_REPLY_LEN {
                return;
            }
            debug!("Reply exceeds {} bytes without terminator", protocol::MAX_REPLY_LEN);
        }
        let reply = std::mem::take(&mut self.reply);

        match command {
            Command::Connect => self.parse_connect(&reply),
            Command::Program => self.parse_program(&reply),
            _ => self.parse_disconnect(&reply),
        }
    }

    fn parse_connect(&mut self, data: &[u8]) {
        match protocol::classify_connect_reply(data) {
            ConnectReply::Version => {
                self.connected = true;
                debug!("Bootloader identified");
            },
            ConnectReply::AlreadyActive => {
                self.connected = true;
                self.active_bootloader_already = true;
                debug!("Found already activated bootloader");
            },
            ConnectReply::Unknown => {},
        }

        if !self.active_bootloader_already && !protocol::contains(data, VERSION_TOKEN) {
            // Keep probing; the timeout reports this reply if nothing better arrives.
            warn!("{}", Error::WrongBootloaderVersion(printable(data)));
            self.foreign_reply = Some(printable(data));
        } else {
            let message = if self.active_bootloader_already {
                ALREADY_ACTIVE_WARNING.to_string()
            } else {
                protocol::welcome_banner(data)
            };
            info!("Connected to bootloader on {}", self.transport.name());
            self.stop_handshake();
            self.emit(Event::Connected {
                connected: true,
                message,
            });
        }

        self.current_command = Command::Idle;
    }

    fn parse_program(&mut self, data: &[u8]) {
        let Some(memory) = self.session.as_ref().map(|s| s.memory()) else {
            debug!("Program reply without a session");
            self.current_command = Command::Idle;
            return;
        };

        if !protocol::accepts_program(data, memory) {
            warn!(
                "Bootloader did not accept {memory} programming, reply: {:?}",
                printable(data)
            );
            self.session = None;
            self.current_command = Command::Idle;
            return;
        }

        info!("Programming {memory} memory...");
        self.current_command = Command::DownloadLine;
    }

    /// Hand the next record of the running session to the transport.
    ///
    /// Called once per poll so that no single poll blocks on more than one
    /// line while the device throttles the link.
    pub(super) fn stream_next_record(&mut self) {
        if self.is_write_busy() {
            return;
        }
        let Some(record) = self.session.as_mut().and_then(ProgrammingSession::next_record) else {
            return;
        };
        let result = self.prepare_command_and_write(Command::DownloadLine, &record, None);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match result {
            Err(e) => {
                warn!("Failed to download line {}: {e}", session.streamed());
                session.halt();
            },
            Ok(()) if session.remaining() == 0 => {
                debug!("Streamed {} records", session.streamed());
            },
            Ok(()) => {},
        }
    }

    fn parse_download_line(&mut self, data: &[u8], now: Instant) {
        match protocol::classify_download_reply(data) {
            DownloadReply::Error => {
                warn!("Device reported a programming error");
                self.finish_upload(false, Error::ProgrammingAborted.to_string());
            },
            DownloadReply::Silent => debug!("Timeout"),
            DownloadReply::Finished => self.finish_upload(true, String::new()),
            DownloadReply::Unrecognized => {
                warn!("{}", Error::UnexpectedDeviceReply(printable(data)));
                self.finish_upload(false, String::new());
            },
            DownloadReply::Ack { pages, finished } => {
                if pages > 0 {
                    self.watchdog.arm(now);
                }
                for _ in 0..pages {
                    let Some(session) = self.session.as_mut() else {
                        break;
                    };
                    let percent = session.acknowledge_page();
                    trace!(
                        "Page {}/{} written",
                        session.acknowledged(),
                        session.expected_chunks()
                    );
                    self.emit(Event::UploadProgress(percent));
                }
                if finished {
                    self.finish_upload(true, String::new());
                }
            },
        }
    }

    fn parse_disconnect(&mut self, data: &[u8]) {
        if protocol::contains(data, DISCONNECT_ACK) {
            info!("Bootloader left on {}", self.transport.name());
            self.transport.close();
            self.current_command = Command::Idle;
        }
    }

    /// End the programming session and report its outcome.
    pub(super) fn finish_upload(&mut self, success: bool, message: String) {
        self.watchdog.stop();
        if let Some(session) = self.session.take() {
            debug!(
                "{} session ended after {} page acks",
                session.memory(),
                session.acknowledged()
            );
        }
        if let Err(e) = self.transport.clear_buffers() {
            debug!("Could not clear transport buffers: {e}");
        }
        self.current_command = Command::Idle;

        if success {
            info!("Upload finished");
        }
        self.emit(Event::FirmwareUploaded { success, message });
    }
}
