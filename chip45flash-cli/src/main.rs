//! chip45flash CLI - Command-line tool for AVR chips running the chip45boot2
//! bootloader.
//!
//! ## Features
//!
//! - Program flash and EEPROM from Intel HEX files
//! - Erase flash or EEPROM by filling it with `0xFF`
//! - Inspect HEX files without a device attached
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

mod commands;
mod config;
mod serial;

use commands::DeviceOptions;
use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Baud rate used when neither the command line nor the config sets one.
const DEFAULT_BAUD: u32 = 115_200;

/// Bootloader handshake timeout used when nothing else sets one.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// The command line or environment cannot be acted on.
    #[error("{0}")]
    Usage(String),
    /// The user interrupted the operation.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    /// Process exit code for this error.
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for any error returned by a command.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>().map_or(1, CliError::exit_code)
}

/// chip45flash - Program AVR chips through the chip45boot2 serial bootloader.
///
/// Environment variables:
///   CHIP45FLASH_PORT              - Default serial port
///   CHIP45FLASH_BAUD              - Default baud rate (default: 115200)
///   CHIP45FLASH_TIMEOUT           - Bootloader handshake timeout in ms
///   CHIP45FLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "chip45flash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  chip45flash -p /dev/ttyUSB0 flash firmware.hex\n  \
                        chip45flash eeprom settings.eep\n  chip45flash erase --eeprom-size 1024")]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "CHIP45FLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the bootloader link [default: 115200].
    #[arg(short, long, global = true, env = "CHIP45FLASH_BAUD")]
    baud: Option<u32>,

    /// Bootloader handshake timeout in milliseconds [default: 2000].
    #[arg(long, global = true, env = "CHIP45FLASH_TIMEOUT", value_name = "MS")]
    timeout: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "CHIP45FLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Program flash memory from an Intel HEX file.
    Flash {
        /// Path to the Intel HEX file.
        hex: PathBuf,
    },

    /// Program EEPROM from an Intel HEX file.
    Eeprom {
        /// Path to the Intel HEX (.eep) file.
        eep: PathBuf,
    },

    /// Erase flash or EEPROM by programming it with 0xFF.
    #[command(group(ArgGroup::new("memory").required(true).args(["flash_size", "eeprom_size"])))]
    Erase {
        /// Bytes of flash to erase (decimal, 0x-hex or with a k suffix).
        #[arg(long, value_name = "N", value_parser = parse_size)]
        flash_size: Option<usize>,

        /// Bytes of EEPROM to erase (decimal, 0x-hex or with a k suffix).
        #[arg(long, value_name = "N", value_parser = parse_size)]
        eeprom_size: Option<usize>,
    },

    /// Show information about an Intel HEX file.
    Info {
        /// Path to the Intel HEX file.
        hex: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a byte count: decimal, `0x` hexadecimal, or with a `k`/`K` suffix
/// meaning KiB. Underscores are ignored.
fn parse_size(s: &str) -> Result<usize, String> {
    let s: String = s.trim().chars().filter(|c| *c != '_').collect();

    let size = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex size: {e}"))?
    } else if let Some(kib) = s.strip_suffix('k').or_else(|| s.strip_suffix('K')) {
        kib.parse::<usize>()
            .map_err(|e| format!("Invalid size: {e}"))?
            .checked_mul(1024)
            .ok_or_else(|| format!("Size too large: {s}"))?
    } else {
        s.parse::<usize>().map_err(|e| format!("Invalid size: {e}"))?
    };

    if size == 0 {
        return Err("Size must be greater than zero".to_string());
    }
    Ok(size)
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "chip45flash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash { hex } => {
            let records = commands::program::load_records(hex)?;
            let options = device_options(cli, &mut config)?;
            commands::program::cmd_program(&options, &records, chip45flash::MemoryType::Flash)
        },
        Commands::Eeprom { eep } => {
            let records = commands::program::load_records(eep)?;
            let options = device_options(cli, &mut config)?;
            commands::program::cmd_program(&options, &records, chip45flash::MemoryType::Eeprom)
        },
        Commands::Erase {
            flash_size,
            eeprom_size,
        } => {
            let (memory, size) = match (flash_size, eeprom_size) {
                (Some(size), None) => (chip45flash::MemoryType::Flash, *size),
                (None, Some(size)) => (chip45flash::MemoryType::Eeprom, *size),
                _ => {
                    return Err(CliError::Usage(
                        "pass exactly one of --flash-size or --eeprom-size".to_string(),
                    )
                    .into());
                },
            };
            let options = device_options(cli, &mut config)?;
            commands::program::cmd_erase(&options, memory, size)
        },
        Commands::Info { hex, json } => commands::info::cmd_info(hex, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Resolve the port and link settings for a device command.
fn device_options(cli: &Cli, config: &mut Config) -> Result<DeviceOptions> {
    let port = get_port(cli, config)?;
    let baud = cli
        .baud
        .or(config.port.connection.baud)
        .unwrap_or(DEFAULT_BAUD);
    let connect_timeout = cli
        .timeout
        .map(Duration::from_millis)
        .or_else(|| config.flash.connect_timeout())
        .unwrap_or(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS));

    Ok(DeviceOptions {
        port,
        baud,
        connect_timeout,
        quiet: cli.quiet,
        fancy: use_fancy_output(),
    })
}

/// Select the serial port, offering to remember an unrecognized adapter.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() && use_fancy_output() {
        ask_remember_port(&selected.port, config)?;
    }
    Ok(selected.port.name)
}
