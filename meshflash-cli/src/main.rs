//! meshflash CLI - Command-line tool for flashing MeshGrid firmware.
//!
//! ## Features
//!
//! - Flash catalog releases (board, version, protocol, BLE) or custom images
//! - SHA-256 verification of release images
//! - Erase flash and reset boards
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use meshflash::ProtocolVariant;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that map to dedicated exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad or missing arguments, or a setup the CLI cannot resolve alone.
    #[error("{0}")]
    Usage(String),
    /// The user cancelled a prompt or pressed Ctrl-C.
    #[error("{0}")]
    Cancelled(String),
}

/// meshflash - Flash MeshGrid LoRa firmware onto ESP32 boards.
///
/// Environment variables:
///   MESHFLASH_PORT              - Default serial port
///   MESHFLASH_BAUD              - Baud rate to switch to after connecting
///   MESHFLASH_FIRMWARE_DIR      - Directory holding release images
///   MESHFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "meshflash")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Examples:\n  \
    meshflash devices\n  \
    meshflash flash --device heltec_v3 --protocol v1only\n  \
    meshflash -p /dev/ttyUSB0 flash --file firmware.bin --no-verify\n  \
    meshflash verify meshgrid-heltec_v3-0.0.8.bin")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "MESHFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for data transfer (the bootloader always starts at 115200).
    #[arg(short, long, global = true, env = "MESHFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "MESHFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Firmware protocol variants.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Protocol {
    /// Dual protocol (v0 + v1).
    Dual,
    /// v1 only.
    V1only,
    /// v0 only (legacy).
    V0only,
}

impl From<Protocol> for ProtocolVariant {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Dual => ProtocolVariant::Dual,
            Protocol::V1only => ProtocolVariant::V1Only,
            Protocol::V0only => ProtocolVariant::V0Only,
        }
    }
}

/// Loader options shared by commands that talk to a board.
#[derive(Args, Clone, Debug, Default)]
pub(crate) struct LoaderArgs {
    /// Stay in the ROM loader even if a stub is configured.
    #[arg(long, conflicts_with = "stub")]
    no_stub: bool,

    /// Flasher stub (TOML with base64 segments) to upload after connecting.
    #[arg(long, value_name = "TOML")]
    stub: Option<PathBuf>,
}

/// Options of the erase command.
#[derive(Args, Clone, Debug)]
pub(crate) struct EraseArgs {
    /// Board id from `meshflash devices`; its flash size is used when the
    /// chip does not report one.
    #[arg(short, long, conflicts_with = "flash_size")]
    device: Option<String>,

    /// Flash size (`4MB`), for boards whose flash ID cannot be read.
    #[arg(long, value_name = "SIZE", value_parser = parse_flash_size)]
    flash_size: Option<u32>,

    #[command(flatten)]
    loader: LoaderArgs,
}

fn parse_flash_size(value: &str) -> std::result::Result<u32, String> {
    meshflash::catalog::parse_flash_size(value)
        .ok_or_else(|| format!("'{value}' is not a flash size such as 4MB"))
}

/// Image and transfer options of the flash command.
#[derive(Args, Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct FlashArgs {
    /// Board id from `meshflash devices`.
    #[arg(short, long, conflicts_with = "file")]
    device: Option<String>,

    /// Release version (default: latest).
    #[arg(long = "version", value_name = "VERSION", conflicts_with = "file")]
    release: Option<String>,

    /// Protocol variant of the release.
    #[arg(long, value_enum, conflicts_with = "file")]
    protocol: Option<Protocol>,

    /// Flash the BLE build of the release.
    #[arg(long, conflicts_with = "file")]
    ble: bool,

    /// Directory holding release images and their .sha256 files.
    #[arg(long, env = "MESHFLASH_FIRMWARE_DIR", value_name = "DIR")]
    firmware_dir: Option<PathBuf>,

    /// Flash a custom image at 0x0 instead of a catalog release.
    #[arg(short, long, value_name = "PATH")]
    file: Option<PathBuf>,

    #[command(flatten)]
    loader: LoaderArgs,

    /// Send raw blocks instead of deflate-compressed ones.
    #[arg(long)]
    no_compress: bool,

    /// Skip the MD5 check of the written flash.
    #[arg(long)]
    no_verify: bool,

    /// Leave the board in the bootloader afterwards.
    #[arg(long)]
    no_reset: bool,

    /// Erase the whole flash before writing.
    #[arg(long)]
    erase: bool,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a release image or a custom file.
    Flash(FlashArgs),

    /// Erase the whole flash.
    Erase(EraseArgs),

    /// Reset the board into its firmware.
    Reset,

    /// List supported boards.
    Devices {
        /// Output the catalog as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List published firmware releases.
    Versions {
        /// Output releases as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check an image against its SHA-256 checksum file.
    Verify {
        /// Image to check.
        file: PathBuf,

        /// Checksum file (default: <file>.sha256).
        #[arg(long, value_name = "PATH")]
        checksum: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

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
        "meshflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::from(exit_code(&err))
        },
    }
}

/// Route Ctrl-C into the library's interrupt checker.
fn install_interrupt_handler() {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    if let Err(e) = ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
        INTERRUPTED.store(true, Ordering::Relaxed);
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
        return;
    }
    meshflash::set_interrupt_checker(move || flag.load(Ordering::Relaxed));
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash(args) => commands::flash::cmd_flash(cli, &mut config, args),
        Commands::Erase(args) => commands::flash::cmd_erase(cli, &mut config, args),
        Commands::Reset => commands::flash::cmd_reset(cli, &mut config),
        Commands::Devices { json } => commands::catalog::cmd_devices(*json),
        Commands::Versions { json } => commands::catalog::cmd_versions(*json),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Verify { file, checksum } => {
            commands::verify::cmd_verify(cli, file, checksum.as_deref())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `meshflash completions bash`, \
                         or use `meshflash completions --install`"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<meshflash::DetectedPort> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Offer to remember boards that are not recognized yet
    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port)
}

fn report_error(err: &anyhow::Error) {
    eprintln!("{} {err:#}", style("Error:").red().bold());
    if let Some(hint) = err
        .downcast_ref::<meshflash::Error>()
        .and_then(meshflash::Error::hint)
    {
        eprintln!("{} {hint}", style("Hint:").yellow().bold());
    }
}

/// Exit codes: 2 usage, 3 configuration, 4 device or port, 130 cancelled,
/// 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }

    match err.downcast_ref::<meshflash::Error>() {
        Some(meshflash::Error::Interrupted) => 130,
        Some(meshflash::Error::Config(_)) => 3,
        Some(
            meshflash::Error::NoResponse { .. }
            | meshflash::Error::PortUnavailable { .. }
            | meshflash::Error::Precondition(_),
        ) => 4,
        _ => 1,
    }
}
