//! Control-line sequences that move the chip between bootloader and
//! application.
//!
//! On the common auto-reset circuit DTR drives IO0 (BOOT) and RTS drives EN
//! (reset), both inverted.

use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::device::USB_SERIAL_JTAG_PID;
use crate::error::{Error, Result};
use crate::port::Port;

/// How the chip is put into download mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStrategy {
    /// DTR/RTS sequence for USB-UART bridges. `extra_delay` holds BOOT
    /// longer for boards with a slow EN RC network.
    Classic {
        /// Use the slow variant.
        extra_delay: bool,
    },
    /// Sequence for the ESP32-S3/C3 built-in USB-JTAG-Serial peripheral.
    UsbJtagSerial,
}

impl ResetStrategy {
    /// Strategies to cycle through while connecting to a device with `pid`.
    pub fn sequence(pid: Option<u16>) -> Vec<Self> {
        if pid == Some(USB_SERIAL_JTAG_PID) {
            vec![Self::UsbJtagSerial]
        } else {
            vec![
                Self::Classic { extra_delay: false },
                Self::Classic { extra_delay: true },
            ]
        }
    }

    /// Reset into the ROM download mode.
    pub fn enter_bootloader<P: Port>(self, port: &mut P, hold: Duration, boot: Duration) -> Result<()> {
        match self {
            Self::Classic { extra_delay } => {
                let boot = if extra_delay { boot * 11 } else { boot };
                debug!("Using classic reset with {}ms boot delay", boot.as_millis());

                port.set_dtr(false)?; // IO0 = HIGH
                port.set_rts(true)?; // EN = LOW, chip in reset
                sleep(hold);
                port.set_dtr(true)?; // IO0 = LOW
                port.set_rts(false)?; // EN = HIGH, chip out of reset
                sleep(boot);
                port.set_dtr(false)?; // IO0 = HIGH, done
            },
            Self::UsbJtagSerial => {
                debug!("Using USB-JTAG-Serial reset");

                port.set_rts(false)?;
                port.set_dtr(false)?; // Idle
                sleep(hold);
                port.set_dtr(true)?; // Set IO0
                port.set_rts(false)?;
                sleep(hold);
                // Go through (1,1) instead of (0,0); Windows only propagates
                // DTR on an RTS change.
                port.set_rts(true)?;
                port.set_dtr(false)?;
                port.set_rts(true)?;
                sleep(hold);
                port.set_control_lines(false, false)?;
            },
        }
        Ok(())
    }
}

/// Pulse EN so the chip boots the application from flash.
///
/// Any failure is reported as [`Error::ResetFailure`]; the flash contents are
/// already committed at this point.
pub fn hard_reset<P: Port>(port: &mut P, hold: Duration) -> Result<()> {
    debug!("Hard resetting via RTS");
    let pulse = |port: &mut P| -> Result<()> {
        port.set_dtr(false)?;
        port.set_rts(true)?;
        sleep(hold);
        port.set_rts(false)
    };
    pulse(port).map_err(|e| Error::ResetFailure {
        reason: e.to_string(),
    })
}
