//! Error types for meshflash.

use std::io;

use thiserror::Error;

use crate::protocol::{CommandType, RomErrorKind};

/// Result type for meshflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message shown when the device does not answer the bootloader sync.
pub const HOLD_BOOT_HINT: &str =
    "Hold the BOOT button while plugging in the board (or while pressing RESET) and try again.";

/// Message shown when the port is held by another program.
pub const PORT_BUSY_HINT: &str =
    "Close any other program using the port (serial monitor, another flasher), wait a moment and try again.";

/// Message shown when the automatic reset did not work.
pub const MANUAL_RESET_HINT: &str =
    "Auto-reset failed. Please manually press the RESET button or unplug/replug USB.";

/// Error type for meshflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The host cannot run a flash session at all (no serial access or
    /// insecure context). Reported before any device interaction.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The serial port is busy or cannot be opened.
    #[error("Port {port} is unavailable: {reason}")]
    PortUnavailable {
        /// Port name/path.
        port: String,
        /// Cause reported by the operating system.
        reason: String,
    },

    /// The bootloader never answered the sync handshake.
    #[error("No response from the bootloader after {attempts} connection attempts")]
    NoResponse {
        /// Number of reset+sync rounds that were tried.
        attempts: usize,
    },

    /// A data block kept failing its checksum until the retry bound ran out.
    #[error(
        "Block {sequence} was rejected {attempts} times ({last}); transfer aborted"
    )]
    BlockRetriesExhausted {
        /// Sequence number of the failing block.
        sequence: u32,
        /// Number of attempts made.
        attempts: usize,
        /// Last rejection reason.
        last: String,
    },

    /// The image does not match its published checksum.
    #[error("Integrity check failed for {name}: expected sha256 {expected}, got {actual}")]
    Integrity {
        /// Image name.
        name: String,
        /// Published digest.
        expected: String,
        /// Digest of the bytes we have.
        actual: String,
    },

    /// A checksum file exists but could not be parsed.
    #[error("Invalid checksum file: {0}")]
    InvalidChecksum(String),

    /// The requested artifact does not exist at the source.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Firmware image cannot be flashed as given.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// The written flash does not match the image.
    #[error("Verification failed at 0x{address:08X}: expected md5 {expected}, device reports {actual}")]
    VerifyFailed {
        /// Start address of the region.
        address: u32,
        /// Digest of the image.
        expected: String,
        /// Digest reported by the device.
        actual: String,
    },

    /// Automatic reset could not toggle the control lines.
    #[error("Reset failed: {reason}")]
    ResetFailure {
        /// Underlying cause.
        reason: String,
    },

    /// Operation called while the session was in the wrong state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Current state of the session.
        state: String,
    },

    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or unexpected frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The loader rejected a command.
    #[error("{command} failed: {kind}")]
    Rom {
        /// Command that failed.
        command: CommandType,
        /// Error code reported by the loader.
        kind: RomErrorKind,
    },

    /// Unsupported chip or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The embedding application asked to stop.
    #[error("Interrupted")]
    Interrupted,
}

impl Error {
    /// Actionable advice for the user, if there is any.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoResponse { .. } => Some(HOLD_BOOT_HINT),
            Self::PortUnavailable { .. } => Some(PORT_BUSY_HINT),
            Self::ResetFailure { .. } => Some(MANUAL_RESET_HINT),
            Self::Integrity { .. } => Some("Download the image again; do not flash a corrupted file."),
            _ => None,
        }
    }

    /// Whether a user action (retry, button press, waiting) can resolve the
    /// error without changing the inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PortUnavailable { .. }
                | Self::NoResponse { .. }
                | Self::ResetFailure { .. }
                | Self::InvalidState { .. }
                | Self::Timeout(_)
        )
    }

    /// Whether the loader rejected a data block because of a bad checksum
    /// or out-of-order sequence. Such blocks are resent.
    pub(crate) fn is_block_rejection(&self) -> bool {
        match self {
            Self::Rom { kind, .. } => kind.is_block_rejection(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }
}
