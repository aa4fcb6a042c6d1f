//! Port abstraction for serial communication with the target.
//!
//! The protocol driver only ever talks to a [`Port`], so the same code runs
//! against a native serial port or the in-memory [`sim::SimPort`].
//!
//! ```text
//! +------------------+     +------------------+
//! |   EspLoader      |     |   EspLoader      |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   Port Trait     |     |   Port Trait     |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! | NativePort       |     | SimPort          |
//! |   (serialport)   |     | (ROM simulator)  |
//! +------------------+     +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshflash::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> meshflash::Result<()> {
//!     port.write_all_bytes(b"\xC0")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read_with_timeout(&mut buf, std::time::Duration::from_millis(100))?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;
pub mod sim;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the data bits.
    #[must_use]
    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Set the stop bits.
    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    /// Set the flow control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 5 data bits.
    Five,
    /// 6 data bits.
    Six,
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified port trait for serial communication.
///
/// Reads follow the port timeout: a read that times out returns
/// `ErrorKind::TimedOut`, which [`Port::read_with_timeout`] turns into a
/// zero-length read.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Set DTR and RTS together. EN and IO0 follow both lines on the usual
    /// auto-reset circuit.
    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.set_dtr(dtr)?;
        self.set_rts(rts)
    }

    /// Read CTS (Clear To Send) pin state.
    fn read_cts(&mut self) -> Result<bool>;

    /// Read DSR (Data Set Ready) pin state.
    fn read_dsr(&mut self) -> Result<bool>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read whatever arrives within `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived; an empty read is not an error.
    fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.timeout() != timeout {
            self.set_timeout(timeout)?;
        }
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        (**self).set_control_lines(dtr, rts)
    }

    fn read_cts(&mut self) -> Result<bool> {
        (**self).read_cts()
    }

    fn read_dsr(&mut self) -> Result<bool> {
        (**self).read_dsr()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Acquires a fresh [`Port`] for a flash session.
///
/// A session opens its port on `connect` and releases it with
/// [`Port::close`] on `disconnect`, so the opener is called once per
/// connect.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Open the port exclusively.
    fn open(&mut self) -> Result<Self::Port>;

    /// USB product ID of the device behind the port, if known.
    fn usb_pid(&self) -> Option<u16> {
        None
    }
}

impl<P, F> PortOpener for F
where
    P: Port,
    F: FnMut() -> Result<P>,
{
    type Port = P;

    fn open(&mut self) -> Result<P> {
        self()
    }
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, SerialOpener};
pub use sim::{SIM_MAC, SimHandle, SimPort};
