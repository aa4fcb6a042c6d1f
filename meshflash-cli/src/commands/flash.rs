//! Flash, erase, and reset command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use meshflash::catalog::{self, DeviceDescriptor};
use meshflash::image::{DirectorySource, load_catalog_image, load_file};
use meshflash::target::DEFAULT_BAUD;
use meshflash::{
    FirmwareImage, FlashSession, FlashStub, LoaderConfig, LogEntry, LogSink, ProtocolVariant,
    SerialConfig, SerialOpener, Severity, Verification,
};
use std::path::PathBuf;

use crate::config::Config;
use crate::{
    Cli, CliError, EraseArgs, FlashArgs, LoaderArgs, get_port, use_fancy_output, was_interrupted,
};

/// Release directory used when neither the flag nor the config names one.
const DEFAULT_FIRMWARE_DIR: &str = "firmware";

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Session log printed on stderr above the progress bar.
///
/// Error entries and the hint that follows them are left to the top-level
/// error report so they are printed once.
struct ConsoleLog {
    bar: ProgressBar,
    quiet: bool,
    after_error: bool,
}

impl ConsoleLog {
    fn new(bar: ProgressBar, quiet: bool) -> Self {
        Self {
            bar,
            quiet,
            after_error: false,
        }
    }
}

impl LogSink for ConsoleLog {
    fn log(&mut self, entry: LogEntry) {
        let skip_hint = std::mem::replace(&mut self.after_error, false);
        let line = match entry.severity {
            Severity::Error => {
                self.after_error = true;
                return;
            },
            Severity::Info if skip_hint || self.quiet => return,
            Severity::Info => format!("{} {}", style("ℹ").blue(), entry.message),
            Severity::Success if self.quiet => return,
            Severity::Success => format!("{} {}", style("✓").green(), entry.message),
        };
        self.bar.suspend(|| eprintln!("{line}"));
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
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
    pb
}

/// Load the stub named on the command line or in the config.
fn resolve_stub(args: &LoaderArgs, config: &Config) -> Result<Option<FlashStub>> {
    if args.no_stub {
        return Ok(None);
    }
    let Some(path) = args.stub.as_ref().or(config.flash.stub.as_ref()) else {
        return Ok(None);
    };
    let stub = FlashStub::from_file(path)
        .with_context(|| format!("Failed to load flasher stub {}", path.display()))?;
    Ok(Some(stub))
}

/// Pick the port and build a disconnected session for it.
fn open_session(
    cli: &Cli,
    config: &mut Config,
    loader: &LoaderArgs,
    loader_config: LoaderConfig,
    bar: &ProgressBar,
) -> Result<FlashSession<SerialOpener>> {
    let stub = resolve_stub(loader, config)?;
    let port = get_port(cli, config)?;
    let baud = cli
        .baud
        .or(config.port.connection.baud)
        .unwrap_or(DEFAULT_BAUD);

    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port.name).green(),
            baud
        );
    }

    // The ROM always answers at the default rate; faster links are negotiated
    let opener = SerialOpener::new(SerialConfig::new(&port.name, DEFAULT_BAUD)).with_usb_pid(port.pid);
    let loader_config = loader_config.with_target_baud((baud != DEFAULT_BAUD).then_some(baud));

    Ok(FlashSession::new(opener, loader_config)
        .with_stub(stub)
        .with_log_sink(ConsoleLog::new(bar.clone(), cli.quiet)))
}

/// Firmware chosen on the command line, with the board it targets.
struct Selection {
    image: FirmwareImage,
    device: Option<&'static DeviceDescriptor>,
}

/// Resolve `--file` or the catalog release described by the flags.
fn resolve_image(args: &FlashArgs, config: &Config) -> Result<Selection> {
    if let Some(path) = &args.file {
        let image = load_file(path)?;
        return Ok(Selection {
            image,
            device: None,
        });
    }

    let device_id = args
        .device
        .as_deref()
        .or(config.flash.device.as_deref())
        .ok_or_else(|| {
            CliError::Usage(
                "no firmware selected: pass --device <id> (see `meshflash devices`) or --file <path>"
                    .to_string(),
            )
        })?;
    let device = catalog::find_device(device_id).ok_or_else(|| {
        CliError::Usage(format!(
            "unknown device '{device_id}' (see `meshflash devices`)"
        ))
    })?;

    if args.ble && !device.supports_ble {
        return Err(CliError::Usage(format!(
            "{} ({}) has no BLE firmware build",
            device.name, device.id
        ))
        .into());
    }

    let version = match args.release.as_deref() {
        Some(v) => catalog::find_version(v).ok_or_else(|| {
            CliError::Usage(format!("unknown firmware version '{v}' (see `meshflash versions`)"))
        })?,
        None => catalog::latest_version(),
    };

    let protocol = match (args.protocol, config.flash.protocol.as_deref()) {
        (Some(protocol), _) => protocol.into(),
        (None, Some(configured)) => configured.parse::<ProtocolVariant>()?,
        (None, None) => ProtocolVariant::default(),
    };

    let name = device.firmware_name(protocol, args.ble, version.version);
    let filename = name.to_filename();
    if catalog::is_published(&name) == Some(false) {
        warn!("{filename} is not part of release {}", version.version);
    }

    let dir = args
        .firmware_dir
        .clone()
        .or_else(|| config.flash.firmware_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FIRMWARE_DIR));
    let mut source = DirectorySource::new(dir);
    let image = load_catalog_image(&mut source, &filename)?;

    Ok(Selection {
        image,
        device: Some(device),
    })
}

fn describe(image: &FirmwareImage) -> String {
    let Some(provenance) = &image.provenance else {
        return format!("{} bytes", image.len());
    };
    let status = match provenance.verification {
        Verification::Verified => "sha256 verified",
        Verification::Unverified => "no checksum published",
        Verification::NotApplicable => "custom image",
    };
    format!("{} ({} bytes, {status})", provenance.filename, image.len())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, args: &FlashArgs) -> Result<()> {
    let selection = resolve_image(args, config)?;
    let image = &selection.image;

    if !cli.quiet {
        eprintln!("{} {}", style("📦").cyan(), describe(image));
        if let Some(device) = selection.device {
            eprintln!(
                "    {} {} [{}, {} flash]",
                style("•").dim(),
                device.name,
                device.chip,
                device.flash_size
            );
        }
    }

    let loader_config = LoaderConfig::new()
        .with_compress(!(args.no_compress || config.flash.no_compress))
        .with_verify(!(args.no_verify || config.flash.skip_verify))
        .with_flash_size(selection.device.and_then(DeviceDescriptor::flash_size_bytes));

    let pb = progress_bar(cli);
    // The CLI resets explicitly so a failed reset can be reported
    let mut session =
        open_session(cli, config, &args.loader, loader_config, &pb)?.with_reset_on_disconnect(false);
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!("{} Waiting for the bootloader...", style("⏳").yellow());
    }
    session.connect()?;

    let result = flash_connected(cli, &mut session, &selection, args, &pb);
    session.disconnect();
    result?;

    if !cli.quiet {
        eprintln!("\n{} Flashing completed!", style("🎉").green().bold());
    }
    Ok(())
}

fn flash_connected(
    cli: &Cli,
    session: &mut FlashSession<SerialOpener>,
    selection: &Selection,
    args: &FlashArgs,
    pb: &ProgressBar,
) -> Result<()> {
    if let (Some(device), Some(chip)) = (selection.device, session.chip()) {
        if device.chip != chip {
            return Err(CliError::Usage(format!(
                "{} uses {}, but the connected board reports {chip}",
                device.name, device.chip
            ))
            .into());
        }
    }
    ensure_not_interrupted()?;

    if args.erase {
        session.erase()?;
        ensure_not_interrupted()?;
    }

    let image = &selection.image;
    let label = image
        .provenance
        .as_ref()
        .map_or_else(|| "image".to_string(), |p| p.filename.clone());
    pb.set_message(format!("Flashing {label}"));

    session.flash(&[image.as_flash_file()], |progress| {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let percent = progress.percentage().round() as u64;
        pb.set_position(percent);
    })?;
    pb.finish_with_message("Complete");
    ensure_not_interrupted()?;

    if args.no_reset {
        if !cli.quiet {
            eprintln!(
                "{} Board left in the bootloader; press RESET to start the firmware",
                style("ℹ").blue()
            );
        }
        return Ok(());
    }

    if !cli.quiet {
        eprintln!("{} Resetting device...", style("🔄").cyan());
    }
    if let Err(e) = session.reset() {
        // The image is written; a failed reset only needs a button press
        eprintln!("{} {e}", style("Warning:").yellow().bold());
        if let Some(hint) = e.hint() {
            eprintln!("{} {hint}", style("Hint:").yellow().bold());
        }
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &mut Config, args: &EraseArgs) -> Result<()> {
    let flash_size = match &args.device {
        Some(id) => {
            let device = catalog::find_device(id).ok_or_else(|| {
                CliError::Usage(format!("unknown device '{id}' (see `meshflash devices`)"))
            })?;
            device.flash_size_bytes()
        },
        None => args.flash_size,
    };

    let pb = ProgressBar::hidden();
    let loader_config = LoaderConfig::new().with_flash_size(flash_size);
    let mut session = open_session(cli, config, &args.loader, loader_config, &pb)?;
    ensure_not_interrupted()?;

    session.connect()?;
    let result = session.erase();
    session.disconnect();
    result?;

    if !cli.quiet {
        eprintln!("\n{} Flash erased", style("🎉").green().bold());
    }
    Ok(())
}

/// Reset command implementation.
pub(crate) fn cmd_reset(cli: &Cli, config: &mut Config) -> Result<()> {
    let pb = ProgressBar::hidden();
    let mut session = open_session(cli, config, &LoaderArgs::default(), LoaderConfig::new(), &pb)?
        .with_reset_on_disconnect(false);
    ensure_not_interrupted()?;

    session.connect()?;
    let result = session.reset();
    session.disconnect();
    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn flash_args(device: Option<&str>) -> FlashArgs {
        FlashArgs {
            device: device.map(str::to_string),
            release: None,
            protocol: None,
            ble: false,
            firmware_dir: None,
            file: None,
            loader: LoaderArgs::default(),
            no_compress: false,
            no_verify: false,
            no_reset: false,
            erase: false,
        }
    }

    fn usage_message(err: &anyhow::Error) -> Option<String> {
        match err.downcast_ref::<CliError>() {
            Some(CliError::Usage(message)) => Some(message.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_resolve_requires_a_firmware_choice() {
        let err = resolve_image(&flash_args(None), &Config::default())
            .err()
            .expect("expected error");
        assert!(usage_message(&err).unwrap().contains("--device"));
    }

    #[test]
    fn test_resolve_rejects_unknown_device_and_version() {
        let err = resolve_image(&flash_args(Some("heltec_v2")), &Config::default())
            .err()
            .expect("expected error");
        assert!(usage_message(&err).unwrap().contains("heltec_v2"));

        let mut args = flash_args(Some("heltec_v3"));
        args.release = Some("9.9.9".to_string());
        let err = resolve_image(&args, &Config::default())
            .err()
            .expect("expected error");
        assert!(usage_message(&err).unwrap().contains("9.9.9"));
    }

    #[test]
    fn test_resolve_rejects_ble_on_board_without_ble() {
        let mut args = flash_args(Some("rak11200"));
        args.ble = true;
        let err = resolve_image(&args, &Config::default())
            .err()
            .expect("expected error");
        assert!(usage_message(&err).unwrap().contains("BLE"));
    }

    #[test]
    fn test_resolve_release_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let name = "meshgrid-heltec_v3_v1only_ble-0.0.7.bin";
        fs::write(dir.path().join(name), b"release image").unwrap();
        fs::write(
            dir.path().join(format!("{name}.sha256")),
            format!("{}  {name}\n", meshflash::image::sha256_hex(b"release image")),
        )
        .unwrap();

        let mut args = flash_args(Some("heltec_v3"));
        args.release = Some("0.0.7".to_string());
        args.ble = true;
        args.firmware_dir = Some(dir.path().to_path_buf());
        let mut config = Config::default();
        config.flash.protocol = Some("v1only".to_string());

        let selection = resolve_image(&args, &config).unwrap();
        assert!(selection.image.is_verified());
        assert_eq!(selection.image.address, catalog::MERGED_IMAGE_ADDRESS);
        assert_eq!(selection.device.map(|d| d.id), Some("heltec_v3"));
    }

    #[test]
    fn test_resolve_missing_release_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = flash_args(Some("station_g1"));
        args.firmware_dir = Some(dir.path().to_path_buf());

        let err = resolve_image(&args, &Config::default())
            .err()
            .expect("expected error");
        assert!(matches!(
            err.downcast_ref::<meshflash::Error>(),
            Some(meshflash::Error::NotFound(_))
        ));
    }

    #[test]
    fn test_resolve_custom_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.bin");
        fs::write(&path, [0xE9u8, 0x03]).unwrap();

        let mut args = flash_args(None);
        args.file = Some(path);
        let selection = resolve_image(&args, &Config::default()).unwrap();
        assert!(selection.device.is_none());
        assert_eq!(describe(&selection.image), "custom.bin (2 bytes, custom image)");
    }

    #[test]
    fn test_resolve_stub_respects_no_stub() {
        let mut config = Config::default();
        config.flash.stub = Some(PathBuf::from("/nonexistent/stub.toml"));

        let args = LoaderArgs {
            no_stub: true,
            stub: None,
        };
        assert!(resolve_stub(&args, &config).unwrap().is_none());
        assert!(resolve_stub(&LoaderArgs::default(), &config).is_err());
        assert!(resolve_stub(&LoaderArgs::default(), &Config::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_console_log_leaves_errors_and_hints_to_report() {
        let mut log = ConsoleLog::new(ProgressBar::hidden(), false);
        log.log(LogEntry::new(Severity::Error, "No response"));
        assert!(log.after_error);
        log.log(LogEntry::new(Severity::Info, "Hold the BOOT button"));
        assert!(!log.after_error);
    }
}
