//! Host-side utilities: environment preconditions and serial port discovery.

use crate::device::DetectedPort;
use crate::error::{Error, Result};

/// Capabilities the host must provide before a flash session may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEnvironment {
    /// Serial ports can be opened from this host.
    pub serial_available: bool,
    /// The session runs in a secure context.
    pub secure_context: bool,
}

impl HostEnvironment {
    /// The environment of a local process.
    ///
    /// Serial access depends on the `native` feature; a local process is
    /// always a secure context.
    #[must_use]
    pub fn native() -> Self {
        Self {
            serial_available: cfg!(feature = "native"),
            secure_context: true,
        }
    }

    /// An environment with every capability present.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            serial_available: true,
            secure_context: true,
        }
    }

    /// Fail with [`Error::Precondition`] naming the first missing capability.
    pub fn check(&self) -> Result<()> {
        if !self.serial_available {
            return Err(Error::Precondition(
                "serial port access is not available on this host".to_string(),
            ));
        }
        if !self.secure_context {
            return Err(Error::Precondition(
                "serial access requires a secure context".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for HostEnvironment {
    fn default() -> Self {
        Self::native()
    }
}

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::detect_ports()
}

/// Discover serial ports that are likely ESP32 boards.
#[must_use]
pub fn discover_esp_ports() -> Vec<DetectedPort> {
    crate::device::detect_esp_ports()
}

/// Auto-detect a single best serial port candidate.
pub fn auto_detect_port() -> Result<DetectedPort> {
    crate::device::auto_detect_port()
}
