//! Command implementations.
//!
//! Each subcommand is implemented in its own module; this module holds the
//! loop that drives the protocol engine for the device commands.

pub(crate) mod completions;
pub(crate) mod info;
pub(crate) mod program;

use {
    crate::CliError,
    anyhow::{Result, bail},
    chip45flash::{Engine, Event, NativePort, Transport},
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, warn},
    std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    },
};

/// Sleep between two engine polls.
const POLL_PERIOD: Duration = Duration::from_millis(2);

/// How long to wait for the device to acknowledge a disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Link settings resolved from the command line and configuration.
#[derive(Debug, Clone)]
pub(crate) struct DeviceOptions {
    /// Serial port name.
    pub port: String,
    /// Baud rate.
    pub baud: u32,
    /// How long to probe for the bootloader.
    pub connect_timeout: Duration,
    /// Suppress non-essential output.
    pub quiet: bool,
    /// Use animations and emoji.
    pub fancy: bool,
}

/// A connected bootloader driven from the command line.
pub(crate) struct DeviceLink {
    engine: Engine<NativePort>,
    interrupted: Arc<AtomicBool>,
    quiet: bool,
}

impl DeviceLink {
    /// Open the port and wait for the bootloader to answer.
    pub fn connect(options: &DeviceOptions) -> Result<Self> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            warn!("Could not install Ctrl-C handler: {e}");
        }

        if !options.quiet {
            eprintln!(
                "{} Using port {} at {} baud",
                style("🔌").cyan(),
                options.port,
                options.baud
            );
            eprintln!("{} Waiting for bootloader...", style("⏳").yellow());
        }

        let mut link = Self {
            engine: Engine::new(NativePort::new()),
            interrupted,
            quiet: options.quiet,
        };
        link.engine
            .connect(&options.port, options.baud, options.connect_timeout, Instant::now())?;

        loop {
            match link.next_event()? {
                Event::Connected {
                    connected: true,
                    message,
                } => {
                    link.report_banner(&message);
                    return Ok(link);
                },
                Event::Connected {
                    connected: false,
                    message,
                } => bail!(message),
                other => debug!("Ignoring {other:?} while connecting"),
            }
        }
    }

    fn report_banner(&self, message: &str) {
        if self.engine.is_bootloader_already_active() {
            warn!("{message}");
        } else if !self.quiet {
            eprintln!("{} {message}", style("✓").green());
        }
    }

    /// Run a programming session started by `start`, rendering its progress
    /// on `bar` until the device reports the outcome.
    pub fn upload(
        &mut self,
        bar: &ProgressBar,
        start: impl FnOnce(&mut Engine<NativePort>) -> chip45flash::Result<()>,
    ) -> Result<()> {
        start(&mut self.engine)?;

        loop {
            match self.next_event()? {
                Event::UploadProgress(percent) => bar.set_position(u64::from(percent)),
                Event::FirmwareUploaded { success: true, .. } => {
                    bar.finish_with_message("done");
                    return Ok(());
                },
                Event::FirmwareUploaded {
                    success: false,
                    message,
                } => {
                    bar.abandon_with_message("failed");
                    bail!(message);
                },
                Event::TransportFault { fault, message } => {
                    warn!("Transport fault ({fault}): {message}");
                },
                Event::Connected { message, .. } => bail!(message),
            }
        }
    }

    /// Ask the bootloader to start the application and release the port.
    pub fn disconnect(mut self) -> Result<()> {
        self.engine.disconnect()?;
        self.wait_port_released();
        Ok(())
    }

    fn wait_port_released(&mut self) {
        let deadline = Instant::now() + DISCONNECT_GRACE;
        while self.engine.transport().is_open() && Instant::now() < deadline {
            self.engine.poll(Instant::now());
            thread::sleep(POLL_PERIOD);
        }
        if self.engine.transport().is_open() {
            debug!("No disconnect acknowledgment; closing the port");
            self.engine.transport_mut().close();
        }
    }

    /// Poll the engine until it reports an event.
    ///
    /// On Ctrl-C the device is told to start its application and the command
    /// is cancelled.
    fn next_event(&mut self) -> Result<Event> {
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                if self.engine.transport().is_open() {
                    let _ = self.engine.disconnect();
                    self.wait_port_released();
                }
                return Err(CliError::Cancelled("interrupted".to_string()).into());
            }

            self.engine.poll(Instant::now());
            if let Some(event) = self.engine.next_event() {
                return Ok(event);
            }
            thread::sleep(POLL_PERIOD);
        }
    }
}

/// Progress bar for an upload, hidden when quiet or not on a terminal.
pub(crate) fn progress_bar(options: &DeviceOptions, message: String) -> ProgressBar {
    if options.quiet || !options.fancy {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    pb
}
