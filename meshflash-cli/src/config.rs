//! Configuration file support for meshflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MESHFLASH_*)
//! 3. Local config file (./meshflash.toml or ./meshflash_ports.toml)
//! 4. Global config file (~/.config/meshflash/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
const LOCAL_CONFIG: &str = "meshflash.toml";

/// Local remembered-ports file name.
const LOCAL_PORTS: &str = "meshflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate to switch to after connecting.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Boards' USB IDs remembered for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Flash defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default board id from the catalog.
    pub device: Option<String>,
    /// Default protocol variant (`dual`, `v1only`, `v0only`).
    pub protocol: Option<String>,
    /// Directory holding release images.
    pub firmware_dir: Option<PathBuf>,
    /// Flasher stub (TOML) to upload after connecting.
    pub stub: Option<PathBuf>,
    /// Skip the post-write MD5 check by default.
    #[serde(default)]
    pub skip_verify: bool,
    /// Send raw blocks instead of deflated ones.
    #[serde(default)]
    pub no_compress: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(ports) = Self::load_ports_config() {
            config.merge_ports(ports);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        read_toml(path)
    }

    /// Remembered ports, local file first.
    fn load_ports_config() -> Option<PortConfig> {
        if let Some(config) = read_toml(Path::new(LOCAL_PORTS)) {
            debug!("Loaded ports config from {LOCAL_PORTS}");
            return Some(config);
        }

        let global_path = Self::global_config_dir()?.join("ports.toml");
        let config = read_toml(&global_path)?;
        debug!("Loaded ports config from {}", global_path.display());
        Some(config)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "meshflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        self.merge_ports(other.port);

        let flash = other.flash;
        if flash.device.is_some() {
            self.flash.device = flash.device;
        }
        if flash.protocol.is_some() {
            self.flash.protocol = flash.protocol;
        }
        if flash.firmware_dir.is_some() {
            self.flash.firmware_dir = flash.firmware_dir;
        }
        if flash.stub.is_some() {
            self.flash.stub = flash.stub;
        }
        self.flash.skip_verify |= flash.skip_verify;
        self.flash.no_compress |= flash.no_compress;
    }

    fn merge_ports(&mut self, other: PortConfig) {
        if other.connection.serial.is_some() {
            self.port.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.port.connection.baud = other.connection.baud;
        }
        for device in other.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }
    }

    /// Whether `vid:pid` was remembered earlier.
    pub fn knows_usb_device(&self, vid: u16, pid: u16) -> bool {
        self.port
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid))
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self.knows_usb_device(vid, pid) {
            return Ok(());
        }

        // Local file when the project already has one, global otherwise
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port.usb_device.push(UsbDevice { vid, pid });

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                None
            },
        },
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            None
        },
    }
}
