//! Offline image verification.

use anyhow::{Context, Result};
use console::style;
use log::warn;
use meshflash::image::{ChecksumFile, sha256_hex};
use meshflash::{FirmwareName, catalog};
use std::fs;
use std::path::{Path, PathBuf};

use crate::Cli;

/// Verify command implementation.
///
/// Prints the image's digest in `sha256sum` format on stdout and checks it
/// against `checksum` (default `<file>.sha256`).
pub(crate) fn cmd_verify(cli: &Cli, file: &Path, checksum: Option<&Path>) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());

    println!("{}  {name}", sha256_hex(&data));

    if !cli.quiet {
        describe_release(&name);
    }

    let checksum_path = checksum.map_or_else(|| sidecar_path(file), Path::to_path_buf);
    let text = match fs::read_to_string(&checksum_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && checksum.is_none() => {
            warn!(
                "No checksum file {}; nothing to compare against",
                checksum_path.display()
            );
            return Ok(());
        },
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read {}", checksum_path.display()));
        },
    };

    let expected = ChecksumFile::parse(&text)?;
    if let Some(listed) = expected.filename.as_deref() {
        if listed != name {
            warn!("{} lists {listed}, not {name}", checksum_path.display());
        }
    }
    expected.verify(&name, &data)?;

    if !cli.quiet {
        eprintln!("{} {name}: checksum OK", style("✓").green());
    }
    Ok(())
}

/// `<file>.sha256` next to `file`.
fn sidecar_path(file: &Path) -> PathBuf {
    let mut path = file.as_os_str().to_owned();
    path.push(".sha256");
    PathBuf::from(path)
}

fn describe_release(name: &str) {
    let Ok(release) = FirmwareName::parse(name) else {
        return;
    };
    let board = catalog::find_device(&release.device_id).map_or("unknown board", |d| d.name);
    eprintln!(
        "{} {board}, {}{}, version {}",
        style("ℹ").blue(),
        release.protocol.label(),
        if release.ble { ", BLE" } else { "" },
        release.version
    );
    if catalog::is_published(&release) == Some(false) {
        warn!("{name} is not part of release {}", release.version);
    }
}
