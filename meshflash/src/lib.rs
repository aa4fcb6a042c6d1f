//! # meshflash
//!
//! A library for flashing MeshGrid LoRa firmware onto ESP32-family boards.
//!
//! This crate provides the core of the flasher:
//!
//! - a serial transport abstraction with a native and a simulated port
//! - the ESP ROM bootloader protocol (SLIP framing, commands, checksums)
//! - a loader driver with reset sequences, optional stub upload and
//!   ACK-gated, retried block transfers
//! - a flash session state machine with progress and log reporting
//! - release images with SHA-256 verification, and the board catalog
//!
//! ## Supported Chips
//!
//! ESP32, ESP32-S2, ESP32-S3, ESP32-C2, ESP32-C3, ESP32-C6 and ESP32-H2.
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization of catalog types and TOML stub loading
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshflash::image::{DirectorySource, load_catalog_image};
//! use meshflash::{FlashSession, LoaderConfig, ProtocolVariant, SerialConfig, SerialOpener, catalog};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = catalog::find_device("heltec_v3").ok_or("unknown board")?;
//!     let name = device.firmware_name(ProtocolVariant::Dual, false, catalog::latest_version().version);
//!
//!     let mut source = DirectorySource::new("firmware");
//!     let image = load_catalog_image(&mut source, &name.to_filename())?;
//!
//!     let opener = SerialOpener::new(SerialConfig::new("/dev/ttyUSB0", 115200));
//!     let config = LoaderConfig::new().with_flash_size(device.flash_size_bytes());
//!     let mut session = FlashSession::new(opener, config);
//!
//!     session.connect()?;
//!     session.flash(&[image.as_flash_file()], |p| {
//!         println!("{:.0}%", p.percentage());
//!     })?;
//!     session.reset()?;
//!     session.disconnect();
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod catalog;
pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod target;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Loops observe it
/// between blocks and while waiting for responses, and stop with
/// [`Error::Interrupted`].
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Interrupt flag for tests. The flag is per thread so parallel tests do not
/// see each other's interrupts.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::cell::Cell;

    thread_local! {
        static TEST_INTERRUPTED: Cell<bool> = const { Cell::new(false) };
    }
    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| set_interrupt_checker(|| TEST_INTERRUPTED.with(Cell::get)));
    TEST_INTERRUPTED.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, SerialOpener};
pub use {
    catalog::{DeviceDescriptor, FirmwareVersion, MERGED_IMAGE_ADDRESS},
    device::{DetectedPort, DeviceKind, TransportKind},
    error::{Error, Result},
    host::{HostEnvironment, auto_detect_port, discover_esp_ports, discover_ports},
    image::{FirmwareImage, FirmwareName, FlashFile, ProtocolVariant, Verification},
    port::{Port, PortEnumerator, PortInfo, PortOpener, SerialConfig, SimHandle, SimPort},
    progress::{LogBook, LogEntry, LogSink, Progress, Severity},
    session::{FlashSession, SessionState},
    target::{ChipFamily, EspLoader, FlashStub, LoaderConfig},
};
