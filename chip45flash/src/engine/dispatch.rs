//! Command dispatcher: at most one outstanding write.
//!
//! Two variables track commands. `current_command` tells the parser how to
//! read the next chunk. `current_write_command` together with the pending
//! buffer gates new writes, and is cleared either when the transport reports
//! the bytes flushed or, for record lines, as soon as the write call returns.
//! Both clears may run for the same write.

use log::{trace, warn};

use super::{Engine, ProgrammingSession};
use crate::error::{Error, Result};
use crate::port::Transport;
use crate::protocol::{Command, printable};

/// Bytes most recently handed to the transport and the command that sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWrite {
    data: Vec<u8>,
    command: Command,
}

impl PendingWrite {
    /// Whether a write is still outstanding.
    pub fn is_outstanding(&self) -> bool {
        !self.data.is_empty()
    }

    /// Bytes handed to the transport.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Command that issued the write.
    pub fn command(&self) -> Command {
        self.command
    }
}

impl<T: Transport> Engine<T> {
    /// Issue `payload` as `command`.
    ///
    /// Fails without touching the transport if a write is still outstanding
    /// or `payload` is empty. `session` is attached only to
    /// [`Command::Program`] writes.
    pub fn prepare_command_and_write(
        &mut self,
        command: Command,
        payload: &[u8],
        session: Option<ProgrammingSession>,
    ) -> Result<()> {
        if self.is_write_busy() {
            warn!(
                "Rejected {command:?} write: {:?} still pending",
                self.current_write_command
            );
            return Err(Error::WriteRejectedBusy);
        }
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }

        // A partial reply belongs to the command it answered.
        if command != self.current_command {
            self.reply.clear();
        }
        self.pending = PendingWrite {
            data: payload.to_vec(),
            command,
        };
        self.current_command = command;
        self.current_write_command = command;
        if command == Command::Program {
            self.session = session;
        }

        trace!("-> {command:?} {:?}", printable(payload));
        let result = self.transport.write(payload);

        // Record lines are acknowledged by the device, not by the flush.
        if command == Command::DownloadLine {
            self.clear_pending_write();
        }

        if let Err(e) = result {
            self.clear_pending_write();
            if command == Command::Program {
                self.session = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Handle the transport's notification that written bytes were flushed.
    pub fn handle_bytes_written(&mut self, count: usize) {
        trace!(
            "Flushed {count} bytes of {:?} write",
            self.pending.command()
        );
        self.clear_pending_write();
    }

    /// The write outstanding, if any.
    pub fn pending_write(&self) -> Option<&PendingWrite> {
        self.pending.is_outstanding().then_some(&self.pending)
    }

    pub(super) fn is_write_busy(&self) -> bool {
        self.pending.is_outstanding() && self.current_write_command != Command::Idle
    }

    pub(super) fn clear_pending_write(&mut self) {
        self.pending = PendingWrite::default();
        self.current_write_command = Command::Idle;
    }
}
