//! Device discovery and classification utilities.
//!
//! Boards show up as serial ports behind a USB-UART bridge or, on the
//! ESP32-S3/C3, through the chip's own USB-JTAG-Serial peripheral. The bridge
//! kind matters for picking a port and the reset sequence.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Espressif USB vendor ID.
pub const ESPRESSIF_VID: u16 = 0x303A;

/// Product ID of the built-in USB-JTAG-Serial peripheral.
pub const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// Transport type for discovered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TransportKind {
    /// Serial transport (UART/USB CDC).
    Serial,
    /// Unknown or unclassified transport.
    Unknown,
}

/// Known USB bridge/device kinds found on ESP32 boards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceKind {
    /// WCH CH340/CH341/CH9102 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Espressif native USB (USB-JTAG-Serial or USB-OTG CDC).
    Espressif,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x55D4, 0x55D3],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (ESPRESSIF_VID, &[], DeviceKind::Espressif),
];

impl DeviceKind {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the device kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH9102",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Espressif => "Espressif USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected device kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Check if this device kind should be preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Espressif | Self::Ch340 | Self::Cp210x)
    }
}

/// Discovered device endpoint information.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Transport type.
    pub transport: TransportKind,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Check if this endpoint is likely an ESP32 board.
    pub fn is_likely_esp(&self) -> bool {
        self.device.is_known()
    }

    /// Whether the port is the chip's own USB-JTAG-Serial peripheral.
    pub fn is_usb_jtag_serial(&self) -> bool {
        self.vid == Some(ESPRESSIF_VID) && self.pid == Some(USB_SERIAL_JTAG_PID)
    }
}

/// Detect all available endpoints with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info.port_name.clone(),
                    transport: TransportKind::Serial,
                    device: DeviceKind::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = DeviceKind::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Without native serial support there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Detect endpoints that are likely ESP32 boards.
pub fn detect_esp_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_esp)
        .collect()
}

/// Pick the best candidate from `ports`.
///
/// Espressif native USB wins, then the common bridges, then any known
/// bridge, then whatever is first.
pub fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    if let Some(port) = ports
        .iter()
        .find(|p| p.device == DeviceKind::Espressif)
    {
        return Ok(port.clone());
    }

    if let Some(port) = ports
        .iter()
        .find(|p| p.device.is_high_priority())
    {
        return Ok(port.clone());
    }

    if let Some(port) = ports.iter().find(|p| p.device.is_known()) {
        return Ok(port.clone());
    }

    ports
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound("no serial port found".to_string()))
}

/// Auto-detect a single ESP32 endpoint.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(detect_ports())?;
    if port.device.is_known() {
        info!("Auto-detected {} port: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port)
}

/// Auto-detection needs native serial support.
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "port auto-detection requires the `native` feature".to_string(),
    ))
}

/// Find an endpoint by name pattern.
pub fn find_port_by_pattern(pattern: &str) -> Result<DetectedPort> {
    detect_ports()
        .into_iter()
        .find(|p| p.name.contains(pattern))
        .ok_or_else(|| Error::NotFound(format!("no serial port matching '{pattern}'")))
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, device: DeviceKind, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            transport: TransportKind::Serial,
            device,
            vid,
            pid,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x55D4), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x303A, 0x1001), DeviceKind::Espressif);
        assert_eq!(DeviceKind::from_vid_pid(0x303A, 0x8000), DeviceKind::Espressif);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_usb_jtag_serial_detection() {
        let jtag = port("/dev/ttyACM0", DeviceKind::Espressif, Some(0x303A), Some(0x1001));
        assert!(jtag.is_usb_jtag_serial());
        assert!(jtag.is_likely_esp());

        let bridge = port("/dev/ttyUSB0", DeviceKind::Cp210x, Some(0x10C4), Some(0xEA60));
        assert!(!bridge.is_usb_jtag_serial());
    }

    #[test]
    fn test_select_port_prefers_espressif() {
        let ports = vec![
            port("/dev/ttyS0", DeviceKind::Unknown, None, None),
            port("/dev/ttyUSB0", DeviceKind::Ftdi, Some(0x0403), Some(0x6001)),
            port("/dev/ttyUSB1", DeviceKind::Ch340, Some(0x1A86), Some(0x7523)),
            port("/dev/ttyACM0", DeviceKind::Espressif, Some(0x303A), Some(0x1001)),
        ];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyACM0");
    }

    #[test]
    fn test_select_port_falls_back_to_first() {
        let ports = vec![port("/dev/ttyS0", DeviceKind::Unknown, None, None)];
        assert_eq!(select_port(ports).unwrap().name, "/dev/ttyS0");
        assert!(matches!(select_port(Vec::new()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_format_port_list() {
        let mut ch340 = port("/dev/ttyUSB0", DeviceKind::Ch340, Some(0x1A86), Some(0x7523));
        ch340.product = Some("USB-Serial".to_string());
        let ports = vec![
            ch340,
            port("/dev/ttyUSB1", DeviceKind::Unknown, Some(0x1234), Some(0x5678)),
        ];

        let formatted = format_port_list(&ports);
        assert_eq!(formatted.len(), 2);
        assert_eq!(formatted[0], "/dev/ttyUSB0 [CH340/CH9102] - USB-Serial");
        assert!(formatted[1].contains("VID:1234 PID:5678"));
    }
}
