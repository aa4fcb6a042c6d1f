//! Native serial port implementation using the `serialport` crate.
//!
//! This module provides the serial port implementation for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).
//!
//! Opening a port that another process holds fails with
//! [`Error::PortUnavailable`] rather than a raw serial error.

use {
    crate::{
        error::{Error, Result},
        port::{
            DataBits, FlowControl, Parity, Port, PortEnumerator, PortInfo, PortOpener,
            SerialConfig, StopBits,
        },
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(
                config
                    .data_bits
                    .into(),
            )
            .parity(
                config
                    .parity
                    .into(),
            )
            .stop_bits(
                config
                    .stop_bits
                    .into(),
            )
            .flow_control(
                config
                    .flow_control
                    .into(),
            )
            .open()
            .map_err(|e| open_error(&config.port_name, e))?;

        debug!("Opened {} at {} baud", config.port_name, config.baud_rate);
        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// Open a serial port with default settings.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig::new(port_name, baud_rate);
        Self::open(&config)
    }
}

/// Classify a failed open. Busy, locked and permission-denied ports are
/// user-recoverable; a port that does not exist is `NotFound`; anything else
/// stays a serial error.
fn open_error(port_name: &str, err: serialport::Error) -> Error {
    let busy = match err.kind() {
        serialport::ErrorKind::NoDevice
        | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
            return Error::NotFound(format!("serial port {port_name} ({})", err.description));
        },
        serialport::ErrorKind::Io(kind) => matches!(
            kind,
            std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::ResourceBusy
                | std::io::ErrorKind::WouldBlock
        ),
        _ => {
            let text = err
                .description
                .to_lowercase();
            text.contains("busy") || text.contains("access is denied") || text.contains("in use")
        },
    };

    if busy {
        Error::PortUnavailable {
            port: port_name.to_string(),
            reason: err.description,
        }
    } else {
        Error::Serial(err)
    }
}

/// Opens a [`NativePort`] from a [`SerialConfig`] each time a session
/// connects.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    config: SerialConfig,
    usb_pid: Option<u16>,
}

impl SerialOpener {
    /// Create an opener for `config`.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            usb_pid: None,
        }
    }

    /// Record the USB product ID so the matching reset sequence is used.
    #[must_use]
    pub fn with_usb_pid(mut self, pid: Option<u16>) -> Self {
        self.usb_pid = pid;
        self
    }

    /// Serial configuration used for each open.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl PortOpener for SerialOpener {
    type Port = NativePort;

    fn open(&mut self) -> Result<NativePort> {
        NativePort::open(&self.config)
    }

    fn usb_pid(&self) -> Option<u16> {
        self.usb_pid
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        if let Some(ref mut p) = self.port {
            p.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        if let Some(ref mut p) = self.port {
            p.write_request_to_send(level)?;
        }
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        if let Some(ref mut p) = self.port {
            p.read_clear_to_send()
                .map_err(Error::Serial)
        } else {
            Err(Error::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "Port is closed",
            )))
        }
    }

    fn read_dsr(&mut self) -> Result<bool> {
        if let Some(ref mut p) = self.port {
            p.read_data_set_ready()
                .map_err(Error::Serial)
        } else {
            Err(Error::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "Port is closed",
            )))
        }
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port
            .take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

/// Native port enumerator.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer
                            .clone(),
                        info.product
                            .clone(),
                        info.serial_number
                            .clone(),
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }
}

// Type conversions from our types to serialport types

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => Self::Five,
            DataBits::Six => Self::Six,
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => Self::None,
            FlowControl::Hardware => Self::Hardware,
            FlowControl::Software => Self::Software,
        }
    }
}
