//! Release image file names.
//!
//! ```text
//! meshgrid-{device}{protocol}{_ble}-{version}.bin
//! meshgrid-heltec_v3_v1only_ble-0.0.8.bin
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const PREFIX: &str = "meshgrid-";
const EXTENSION: &str = ".bin";
const BLE_SUFFIX: &str = "_ble";

/// Mesh protocol variant built into the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtocolVariant {
    /// Speaks both v0 and v1.
    #[default]
    Dual,
    /// v1 only.
    V1Only,
    /// v0 only.
    V0Only,
}

impl ProtocolVariant {
    /// All variants, recommended first.
    pub const ALL: [Self; 3] = [Self::Dual, Self::V1Only, Self::V0Only];

    /// File name suffix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Dual => "",
            Self::V1Only => "_v1only",
            Self::V0Only => "_v0only",
        }
    }

    /// Display label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Dual => "Dual Protocol (v0 + v1)",
            Self::V1Only => "v1 Only",
            Self::V0Only => "v0 Only",
        }
    }

    /// One-line description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Dual => "Works with all devices (recommended)",
            Self::V1Only => "Enhanced security (AES-256-GCM)",
            Self::V0Only => "MeshCore compatibility only",
        }
    }

    /// Key used on the command line and in config files.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Dual => "dual",
            Self::V1Only => "v1only",
            Self::V0Only => "v0only",
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ProtocolVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|v| v.key().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Config(format!("unknown protocol variant '{s}' (expected dual, v1only or v0only)")))
    }
}

/// Parsed release image name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirmwareName {
    /// Catalog device id (`heltec_v3`).
    pub device_id: String,
    /// Protocol variant.
    pub protocol: ProtocolVariant,
    /// Built with Bluetooth LE.
    pub ble: bool,
    /// Release version (`0.0.8`).
    pub version: String,
}

impl FirmwareName {
    /// Create a name.
    pub fn new(
        device_id: impl Into<String>,
        protocol: ProtocolVariant,
        ble: bool,
        version: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
            ble,
            version: version.into(),
        }
    }

    /// Firmware id: device id plus variant suffixes.
    pub fn firmware_id(&self) -> String {
        format!(
            "{}{}{}",
            self.device_id,
            self.protocol.suffix(),
            if self.ble { BLE_SUFFIX } else { "" }
        )
    }

    /// Release file name.
    pub fn to_filename(&self) -> String {
        format!("{PREFIX}{}-{}{EXTENSION}", self.firmware_id(), self.version)
    }

    /// Name of the detached checksum file.
    pub fn checksum_filename(&self) -> String {
        format!("{}.sha256", self.to_filename())
    }

    /// Parse a release file name.
    ///
    /// The version starts after the last `-` that is followed by a digit;
    /// `_ble` is stripped before the protocol suffix.
    pub fn parse(filename: &str) -> Result<Self> {
        let invalid = || Error::InvalidImage(format!("'{filename}' is not a release image name"));

        let stem = filename
            .strip_prefix(PREFIX)
            .and_then(|s| s.strip_suffix(EXTENSION))
            .ok_or_else(invalid)?;

        let split = stem
            .char_indices()
            .rev()
            .find(|(i, c)| *c == '-' && stem[i + 1..].starts_with(|d: char| d.is_ascii_digit()))
            .map(|(i, _)| i)
            .ok_or_else(invalid)?;
        let (firmware_id, version) = (&stem[..split], &stem[split + 1..]);

        let (rest, ble) = match firmware_id.strip_suffix(BLE_SUFFIX) {
            Some(rest) => (rest, true),
            None => (firmware_id, false),
        };

        let (device_id, protocol) = [ProtocolVariant::V1Only, ProtocolVariant::V0Only]
            .into_iter()
            .find_map(|p| {
                rest.strip_suffix(p.suffix())
                    .map(|d| (d, p))
            })
            .unwrap_or((rest, ProtocolVariant::Dual));

        if device_id.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(device_id, protocol, ble, version))
    }
}

impl fmt::Display for FirmwareName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_filename())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_format() {
        let name = FirmwareName::new("heltec_v3", ProtocolVariant::V1Only, true, "0.0.8");
        assert_eq!(name.to_filename(), "meshgrid-heltec_v3_v1only_ble-0.0.8.bin");
        assert_eq!(
            name.checksum_filename(),
            "meshgrid-heltec_v3_v1only_ble-0.0.8.bin.sha256"
        );
    }

    #[test]
    fn test_parse_every_variant() {
        for protocol in ProtocolVariant::ALL {
            for ble in [false, true] {
                let name = FirmwareName::new("lilygo_t3s3", protocol, ble, "0.0.8");
                assert_eq!(FirmwareName::parse(&name.to_filename()).unwrap(), name);
            }
        }
    }

    #[test]
    fn test_parse_device_with_digits_and_prerelease() {
        let name = FirmwareName::parse("meshgrid-rak11200-1.2.0-rc1.bin").unwrap();
        assert_eq!(name.device_id, "rak11200");
        assert_eq!(name.version, "1.2.0-rc1");
        assert_eq!(name.protocol, ProtocolVariant::Dual);
        assert!(!name.ble);
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert!(FirmwareName::parse("firmware.bin").is_err());
        assert!(FirmwareName::parse("meshgrid-heltec_v3.bin").is_err());
        assert!(FirmwareName::parse("meshgrid-heltec_v3-0.0.8.hex").is_err());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("V1ONLY".parse::<ProtocolVariant>().unwrap(), ProtocolVariant::V1Only);
        assert!("v2".parse::<ProtocolVariant>().is_err());
        assert_eq!(ProtocolVariant::Dual.to_string(), "Dual Protocol (v0 + v1)");
    }
}
