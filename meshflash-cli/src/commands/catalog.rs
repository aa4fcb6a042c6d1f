//! Board and release listings.

use anyhow::Result;
use console::style;
use meshflash::catalog::{self, DEVICES, FIRMWARE_VERSIONS};
use meshflash::{DeviceDescriptor, FirmwareVersion, ProtocolVariant};

/// Devices command implementation.
pub(crate) fn cmd_devices(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(DEVICES)?);
        return Ok(());
    }

    eprintln!("{}", style("Supported boards:").bold());
    for device in DEVICES {
        println!("{}", device_line(device));
        println!(
            "      {}",
            style(device.features.join(", ")).dim()
        );
    }
    Ok(())
}

fn device_line(device: &DeviceDescriptor) -> String {
    let ble = if device.supports_ble { "  BLE" } else { "" };
    format!(
        "  {:<22} {:<26} {:<9} {:>5}{ble}",
        style(device.id).green(),
        device.name,
        device.arch,
        device.flash_size
    )
}

/// Versions command implementation.
pub(crate) fn cmd_versions(json: bool) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "versions": FIRMWARE_VERSIONS,
            "latest": catalog::latest_version().version,
            "protocols": ProtocolVariant::ALL
                .iter()
                .map(|p| serde_json::json!({
                    "key": p.key(),
                    "label": p.label(),
                    "description": p.description(),
                }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware releases:").bold());
    for version in FIRMWARE_VERSIONS {
        println!("{}", version_line(version));
    }

    eprintln!();
    eprintln!("{}", style("Protocol variants (--protocol):").bold());
    for protocol in ProtocolVariant::ALL {
        eprintln!(
            "  {:<8} {}: {}",
            style(protocol.key()).cyan(),
            protocol.label(),
            style(protocol.description()).dim()
        );
    }
    Ok(())
}

fn version_line(version: &FirmwareVersion) -> String {
    let latest = if version.latest {
        format!("  {}", style("(latest)").yellow())
    } else {
        String::new()
    };
    format!(
        "  {:<8} {:<16} {}{latest}",
        style(version.version).green(),
        version.name,
        version.date
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_line_marks_ble_boards() {
        console::set_colors_enabled(false);
        let v3 = catalog::find_device("heltec_v3").unwrap();
        let line = device_line(v3);
        assert!(line.contains("heltec_v3"));
        assert!(line.contains("8MB"));
        assert!(line.ends_with("BLE"));

        let rak = catalog::find_device("rak11200").unwrap();
        assert!(!device_line(rak).contains("BLE"));
    }

    #[test]
    fn test_version_line_marks_latest() {
        console::set_colors_enabled(false);
        let latest = catalog::latest_version();
        assert!(version_line(latest).ends_with("(latest)"));
        let older = catalog::find_version("0.0.5").unwrap();
        assert!(!version_line(older).contains("latest"));
    }
}
