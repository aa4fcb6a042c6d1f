//! Supported boards and published firmware releases.

use crate::image::{FirmwareName, ProtocolVariant};
use crate::target::ChipFamily;

/// Flash address of merged release images.
pub const MERGED_IMAGE_ADDRESS: u32 = 0x0;

/// A supported board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceDescriptor {
    /// Catalog id, also the firmware file name stem.
    pub id: &'static str,
    /// Marketing name.
    pub name: &'static str,
    /// Chip family on the board.
    pub chip: ChipFamily,
    /// Architecture label.
    pub arch: &'static str,
    /// Flash size label (`8MB`).
    pub flash_size: &'static str,
    /// Board features.
    pub features: &'static [&'static str],
    /// Partition table the release is built with.
    pub partitions: &'static str,
    /// Whether BLE builds are published.
    pub supports_ble: bool,
}

impl DeviceDescriptor {
    /// Flash size in bytes, parsed from the `flash_size` label.
    #[must_use]
    pub fn flash_size_bytes(&self) -> Option<u32> {
        parse_flash_size(self.flash_size)
    }

    /// Release image name for this board.
    pub fn firmware_name(&self, protocol: ProtocolVariant, ble: bool, version: &str) -> FirmwareName {
        FirmwareName::new(self.id, protocol, ble && self.supports_ble, version)
    }
}

#[allow(clippy::too_many_arguments)]
const fn board(
    id: &'static str,
    name: &'static str,
    chip: ChipFamily,
    arch: &'static str,
    flash_size: &'static str,
    features: &'static [&'static str],
    partitions: &'static str,
    supports_ble: bool,
) -> DeviceDescriptor {
    DeviceDescriptor {
        id,
        name,
        chip,
        arch,
        flash_size,
        features,
        partitions,
        supports_ble,
    }
}

/// Every supported board.
pub static DEVICES: &[DeviceDescriptor] = &[
    // ESP32-S3
    board(
        "heltec_v3",
        "Heltec WiFi LoRa 32 V3",
        ChipFamily::Esp32S3,
        "ESP32-S3",
        "8MB",
        &["OLED Display", "SX1262 LoRa"],
        "partitions_4mb_ota.csv",
        true,
    ),
    board(
        "heltec_v4",
        "Heltec WiFi LoRa 32 V4",
        ChipFamily::Esp32S3,
        "ESP32-S3",
        "8MB",
        &["OLED Display", "SX1262 LoRa", "USB CDC"],
        "partitions_8mb_ota.csv",
        true,
    ),
    board(
        "lilygo_t3s3",
        "LilyGo T3-S3",
        ChipFamily::Esp32S3,
        "ESP32-S3",
        "16MB",
        &["OLED Display", "SX1262 LoRa", "PSRAM"],
        "default",
        true,
    ),
    board(
        "lilygo_tbeam_supreme",
        "LilyGo T-Beam Supreme",
        ChipFamily::Esp32S3,
        "ESP32-S3",
        "8MB",
        &["SX1262 LoRa", "GPS"],
        "default",
        false,
    ),
    board(
        "station_g2",
        "B&Q Station G2",
        ChipFamily::Esp32S3,
        "ESP32-S3",
        "8MB",
        &["OLED Display", "SX1262 LoRa"],
        "default",
        false,
    ),
    board(
        "seeed_xiao_esp32s3",
        "Seeed XIAO ESP32S3",
        ChipFamily::Esp32S3,
        "ESP32-S3",
        "8MB",
        &["Compact", "SX1262 LoRa"],
        "default",
        false,
    ),
    // ESP32
    board(
        "lilygo_tbeam",
        "LilyGo T-Beam",
        ChipFamily::Esp32,
        "ESP32",
        "4MB",
        &["OLED Display", "SX1276 LoRa", "GPS", "AXP192/AXP2101"],
        "partitions_4mb_ota.csv",
        false,
    ),
    board(
        "nano_g1",
        "B&Q Nano G1",
        ChipFamily::Esp32,
        "ESP32",
        "4MB",
        &["SX1262 LoRa", "Compact"],
        "default",
        false,
    ),
    board(
        "station_g1",
        "B&Q Station G1",
        ChipFamily::Esp32,
        "ESP32",
        "4MB",
        &["OLED Display", "SX1262 LoRa"],
        "default",
        false,
    ),
    board(
        "rak11200",
        "RAK11200",
        ChipFamily::Esp32,
        "ESP32",
        "4MB",
        &["SX1262 LoRa"],
        "default",
        false,
    ),
    board(
        "m5stack",
        "M5Stack",
        ChipFamily::Esp32,
        "ESP32",
        "4MB",
        &["TFT Display", "SX1276 LoRa"],
        "default",
        false,
    ),
    // ESP32-C3
    board(
        "heltec_ht62",
        "Heltec HT62",
        ChipFamily::Esp32C3,
        "ESP32-C3",
        "4MB",
        &["SX1262 LoRa", "Compact", "RISC-V"],
        "default",
        false,
    ),
];

/// Parse a flash size label such as `4MB` into bytes.
#[must_use]
pub fn parse_flash_size(label: &str) -> Option<u32> {
    let mb = label
        .trim()
        .strip_suffix("MB")?;
    mb.trim()
        .parse::<u32>()
        .ok()?
        .checked_mul(1024 * 1024)
}

/// Look a board up by id.
#[must_use]
pub fn find_device(id: &str) -> Option<&'static DeviceDescriptor> {
    DEVICES.iter().find(|d| d.id == id)
}

/// A published firmware release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FirmwareVersion {
    /// Version string (`0.0.8`).
    pub version: &'static str,
    /// Release title.
    pub name: &'static str,
    /// Release date, ISO 8601.
    pub date: &'static str,
    /// Whether this is the newest release.
    pub latest: bool,
}

/// Published releases, newest first.
pub static FIRMWARE_VERSIONS: &[FirmwareVersion] = &[
    FirmwareVersion {
        version: "0.0.8",
        name: "Release 0.0.8",
        date: "2025-01-30",
        latest: true,
    },
    FirmwareVersion {
        version: "0.0.7",
        name: "Release 0.0.7",
        date: "2025-01-29",
        latest: false,
    },
    FirmwareVersion {
        version: "0.0.6",
        name: "Release 0.0.6",
        date: "2025-01-28",
        latest: false,
    },
    FirmwareVersion {
        version: "0.0.5",
        name: "Release 0.0.5",
        date: "2025-01-27",
        latest: false,
    },
];

/// The newest release.
#[must_use]
pub fn latest_version() -> &'static FirmwareVersion {
    FIRMWARE_VERSIONS
        .iter()
        .find(|v| v.latest)
        .unwrap_or(&FIRMWARE_VERSIONS[0])
}

/// Look a release up by version string.
#[must_use]
pub fn find_version(version: &str) -> Option<&'static FirmwareVersion> {
    FIRMWARE_VERSIONS
        .iter()
        .find(|v| v.version == version)
}

/// Image names bundled with the latest release.
pub static LATEST_IMAGES: &[&str] = &[
    "meshgrid-heltec_v3-0.0.8.bin",
    "meshgrid-heltec_v3_ble-0.0.8.bin",
    "meshgrid-heltec_v3_v0only-0.0.8.bin",
    "meshgrid-heltec_v3_v1only-0.0.8.bin",
    "meshgrid-heltec_v4-0.0.8.bin",
    "meshgrid-lilygo_t3s3-0.0.8.bin",
    "meshgrid-lilygo_t3s3_ble-0.0.8.bin",
    "meshgrid-lilygo_t3s3_v0only-0.0.8.bin",
    "meshgrid-lilygo_t3s3_v1only-0.0.8.bin",
    "meshgrid-lilygo_tbeam_supreme-0.0.8.bin",
    "meshgrid-station_g2-0.0.8.bin",
    "meshgrid-seeed_xiao_esp32s3-0.0.8.bin",
    "meshgrid-lilygo_tbeam-0.0.8.bin",
    "meshgrid-lilygo_tbeam_v1only-0.0.8.bin",
    "meshgrid-nano_g1-0.0.8.bin",
    "meshgrid-station_g1-0.0.8.bin",
    "meshgrid-rak11200-0.0.8.bin",
    "meshgrid-m5stack-0.0.8.bin",
    "meshgrid-heltec_ht62-0.0.8.bin",
];

/// Whether `name` is known to be published. Only the latest release is
/// listed; names for older releases return `None`.
#[must_use]
pub fn is_published(name: &FirmwareName) -> Option<bool> {
    if name.version != latest_version().version {
        return None;
    }
    let filename = name.to_filename();
    Some(LATEST_IMAGES.contains(&filename.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_has_twelve_complete_boards() {
        assert_eq!(DEVICES.len(), 12);
        for device in DEVICES {
            assert!(!device.id.is_empty());
            assert!(!device.name.is_empty());
            assert!(!device.features.is_empty());
            assert!(device.flash_size_bytes().is_some(), "{}", device.id);
        }
    }

    #[test]
    fn test_ble_boards() {
        let ble: Vec<_> = DEVICES
            .iter()
            .filter(|d| d.supports_ble)
            .map(|d| d.id)
            .collect();
        assert_eq!(ble, vec!["heltec_v3", "heltec_v4", "lilygo_t3s3"]);
    }

    #[test]
    fn test_find_device() {
        let device = find_device("lilygo_t3s3").unwrap();
        assert_eq!(device.chip, ChipFamily::Esp32S3);
        assert_eq!(device.flash_size_bytes(), Some(16 * 1024 * 1024));
        assert!(find_device("heltec_v2").is_none());
    }

    #[test]
    fn test_parse_flash_size() {
        assert_eq!(parse_flash_size("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(parse_flash_size(" 16 MB "), Some(16 * 1024 * 1024));
        assert_eq!(parse_flash_size("4096"), None);
        assert_eq!(parse_flash_size("9999MB"), None);
    }

    #[test]
    fn test_firmware_name_drops_ble_for_boards_without_it() {
        let device = find_device("rak11200").unwrap();
        let name = device.firmware_name(ProtocolVariant::Dual, true, "0.0.8");
        assert_eq!(name.to_filename(), "meshgrid-rak11200-0.0.8.bin");
    }

    #[test]
    fn test_latest_version() {
        assert_eq!(latest_version().version, "0.0.8");
        assert_eq!(FIRMWARE_VERSIONS.iter().filter(|v| v.latest).count(), 1);
        assert_eq!(find_version("0.0.6").unwrap().date, "2025-01-28");
    }

    #[test]
    fn test_published_images() {
        let v3 = find_device("heltec_v3").unwrap();
        assert_eq!(
            is_published(&v3.firmware_name(ProtocolVariant::V1Only, false, "0.0.8")),
            Some(true)
        );
        assert_eq!(
            is_published(&v3.firmware_name(ProtocolVariant::V1Only, true, "0.0.8")),
            Some(false)
        );
        assert_eq!(
            is_published(&v3.firmware_name(ProtocolVariant::Dual, false, "0.0.7")),
            None
        );
        for name in LATEST_IMAGES {
            let parsed = FirmwareName::parse(name).unwrap();
            assert!(find_device(&parsed.device_id).is_some(), "{name}");
        }
    }
}
