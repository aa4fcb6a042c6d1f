//! Flash session state machine.
//!
//! ```text
//!                connect()            loader ready
//! Disconnected ───────────► Connecting ────────────► Connected ◄──┐
//!      ▲                        │ failure                │        │ done / failed
//!      │                        ▼                flash() │ erase()│
//!      └──────────────── Disconnected              Flashing ──────┘
//!      disconnect() from any state
//! ```
//!
//! A [`FlashSession`] owns at most one open port. `connect` on a connected
//! session tears the old connection down first. Device operations on a
//! session that is not `Connected` fail with [`Error::InvalidState`] before
//! anything is written to the port.

use std::fmt;

use log::debug;

use crate::error::{Error, Result};
use crate::host::HostEnvironment;
use crate::image::FlashFile;
use crate::port::{Port, PortOpener};
use crate::progress::{LogEntry, LogSink, Progress, Severity};
use crate::target::{ChipFamily, EspLoader, FLASH_SECTOR_SIZE, FlashStub, LoaderConfig};

/// Connection state of a [`FlashSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port is open.
    Disconnected,
    /// Opening the port and negotiating with the bootloader.
    Connecting,
    /// Bootloader is ready for commands.
    Connected,
    /// An image transfer is running.
    Flashing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Flashing => write!(f, "flashing"),
        }
    }
}

/// One connection to one board.
pub struct FlashSession<O: PortOpener> {
    opener: O,
    config: LoaderConfig,
    stub: Option<FlashStub>,
    environment: HostEnvironment,
    loader: Option<EspLoader<O::Port>>,
    state: SessionState,
    sink: Option<Box<dyn LogSink>>,
    reset_on_disconnect: bool,
}

impl<O: PortOpener> FlashSession<O> {
    /// Create a disconnected session that opens ports through `opener`.
    pub fn new(opener: O, config: LoaderConfig) -> Self {
        Self {
            opener,
            config,
            stub: None,
            environment: HostEnvironment::native(),
            loader: None,
            state: SessionState::Disconnected,
            sink: None,
            reset_on_disconnect: true,
        }
    }

    /// Upload `stub` after connecting. Without one the ROM loader is used.
    #[must_use]
    pub fn with_stub(mut self, stub: Option<FlashStub>) -> Self {
        self.stub = stub;
        self
    }

    /// Check `environment` instead of the native one on connect.
    #[must_use]
    pub fn with_environment(mut self, environment: HostEnvironment) -> Self {
        self.environment = environment;
        self
    }

    /// Send user-facing log entries to `sink`.
    #[must_use]
    pub fn with_log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Whether `disconnect` resets the board before closing the port.
    /// Without the reset the chip stays in its bootloader.
    #[must_use]
    pub fn with_reset_on_disconnect(mut self, reset: bool) -> Self {
        self.reset_on_disconnect = reset;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Chip detected on connect.
    pub fn chip(&self) -> Option<ChipFamily> {
        self.loader
            .as_ref()
            .and_then(EspLoader::chip)
    }

    /// Whether the flasher stub is running.
    pub fn is_stub(&self) -> bool {
        self.loader
            .as_ref()
            .is_some_and(EspLoader::is_stub)
    }

    /// Baud rate of the open link.
    pub fn baud_rate(&self) -> Option<u32> {
        self.loader
            .as_ref()
            .map(EspLoader::baud_rate)
    }

    /// Factory MAC address of the connected chip.
    pub fn mac_address(&self) -> Option<&str> {
        self.loader
            .as_ref()
            .and_then(EspLoader::mac)
    }

    /// Flash size in bytes: detected on connect, or as configured.
    pub fn flash_size(&self) -> Option<u32> {
        self.loader
            .as_ref()
            .and_then(EspLoader::flash_size)
            .or(self.config.flash_size)
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Open the port and connect to the bootloader.
    pub fn connect(&mut self) -> Result<ChipFamily> {
        if let Err(e) = self.environment.check() {
            self.report(&e);
            return Err(e);
        }

        if self.state != SessionState::Disconnected {
            self.disconnect();
        }

        self.set_state(SessionState::Connecting);
        self.log(Severity::Info, "Connecting to device...");

        let port = match self.opener.open() {
            Ok(port) => port,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                self.report(&e);
                return Err(e);
            },
        };

        let mut loader =
            EspLoader::new(port, self.config.clone()).with_usb_pid(self.opener.usb_pid());
        match loader.connect(self.stub.as_ref()) {
            Ok(chip) => {
                let mode = if loader.is_stub() { "stub" } else { "ROM loader" };
                let mut message = format!("Connected to {chip} ({mode}, {} baud", loader.baud_rate());
                if let Some(mac) = loader.mac() {
                    message = format!("{message}, MAC {mac}");
                }
                message.push(')');
                self.loader = Some(loader);
                self.set_state(SessionState::Connected);
                self.log(Severity::Success, message);
                Ok(chip)
            },
            Err(e) => {
                if let Err(close_err) = loader.close() {
                    debug!("Closing port after failed connect: {close_err}");
                }
                self.set_state(SessionState::Disconnected);
                self.report(&e);
                Err(e)
            },
        }
    }

    /// Write `files` in order.
    ///
    /// `on_progress` is called after every acknowledged block. The session is
    /// back in `Connected` when this returns, whether or not the write
    /// succeeded.
    pub fn flash(
        &mut self,
        files: &[FlashFile<'_>],
        mut on_progress: impl FnMut(Progress),
    ) -> Result<()> {
        self.require_connected("flash")?;
        if let Err(e) = self.validate(files) {
            self.report(&e);
            return Err(e);
        }

        self.set_state(SessionState::Flashing);
        let result = self.write_files(files, &mut on_progress);
        self.set_state(SessionState::Connected);

        match &result {
            Ok(()) => self.log(Severity::Success, "Flashing complete"),
            Err(e) => self.report(e),
        }
        result
    }

    fn validate(&self, files: &[FlashFile<'_>]) -> Result<()> {
        if files.is_empty() {
            return Err(Error::InvalidImage("nothing to flash".into()));
        }
        for file in files {
            if file.data.is_empty() {
                return Err(Error::InvalidImage(format!(
                    "image for 0x{:08X} is empty",
                    file.address
                )));
            }
            if file.address % FLASH_SECTOR_SIZE != 0 {
                return Err(Error::InvalidImage(format!(
                    "address 0x{:08X} is not aligned to a {FLASH_SECTOR_SIZE:#x} byte sector",
                    file.address
                )));
            }
            if let Some(size) = self.flash_size() {
                let end = u64::from(file.address) + file.data.len() as u64;
                if end > u64::from(size) {
                    return Err(Error::InvalidImage(format!(
                        "{} bytes at 0x{:08X} do not fit in {} MB of flash",
                        file.data.len(),
                        file.address,
                        size / (1024 * 1024)
                    )));
                }
            }
        }
        Ok(())
    }

    fn write_files(
        &mut self,
        files: &[FlashFile<'_>],
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<()> {
        let count = files.len();
        for (index, file) in files.iter().enumerate() {
            self.log(
                Severity::Info,
                format!(
                    "Writing file {}/{count}: {} bytes at 0x{:08X}",
                    index + 1,
                    file.data.len(),
                    file.address
                ),
            );
            self.loader_mut()?
                .write_flash(file.address, file.data, &mut |written, total| {
                    on_progress(Progress {
                        file_index: index,
                        written,
                        total,
                    });
                })?;
        }
        self.loader_mut()?.finish_flash()
    }

    /// Erase the whole flash. Like [`FlashSession::flash`], the session is
    /// `Flashing` meanwhile and back in `Connected` afterwards.
    pub fn erase(&mut self) -> Result<()> {
        self.require_connected("erase")?;
        self.log(Severity::Info, "Erasing flash (this may take a while)...");

        self.set_state(SessionState::Flashing);
        let result = self
            .loader_mut()
            .and_then(EspLoader::erase_flash);
        self.set_state(SessionState::Connected);

        match &result {
            Ok(()) => self.log(Severity::Success, "Flash erased"),
            Err(e) => self.report(e),
        }
        result
    }

    /// Reset the board into its firmware.
    ///
    /// A failure is reported as [`Error::ResetFailure`] and leaves the
    /// session as it was; the image on flash is unaffected.
    pub fn reset(&mut self) -> Result<()> {
        self.require_connected("reset")?;

        let result = self.loader_mut()?.hard_reset();
        match &result {
            Ok(()) => self.log(Severity::Success, "Device reset"),
            Err(e) => self.report(e),
        }
        result
    }

    /// Reset the board, close the port and drop all connection state.
    ///
    /// Never fails and may be called in any state.
    pub fn disconnect(&mut self) {
        let Some(mut loader) = self.loader.take() else {
            self.set_state(SessionState::Disconnected);
            return;
        };

        if self.reset_on_disconnect {
            if let Err(e) = loader.hard_reset() {
                debug!("Reset during disconnect failed: {e}");
            }
        }
        if let Err(e) = loader.close() {
            debug!("Closing port failed: {e}");
        }
        drop(loader);

        self.set_state(SessionState::Disconnected);
        self.log(Severity::Info, "Disconnected");
    }

    fn require_connected(&self, operation: &'static str) -> Result<()> {
        if self.state != SessionState::Connected || self.loader.is_none() {
            return Err(Error::InvalidState {
                operation,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn loader_mut(&mut self) -> Result<&mut EspLoader<O::Port>> {
        let state = self.state.to_string();
        self.loader
            .as_mut()
            .ok_or(Error::InvalidState {
                operation: "use the loader",
                state,
            })
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state: {} -> {state}", self.state);
            self.state = state;
        }
    }

    fn log(&mut self, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry::new(severity, message);
        debug!("[{}] {}", entry.severity, entry.message);
        if let Some(sink) = self.sink.as_mut() {
            sink.log(entry);
        }
    }

    fn report(&mut self, err: &Error) {
        self.log(Severity::Error, err.to_string());
        if let Some(hint) = err.hint() {
            self.log(Severity::Info, hint);
        }
    }
}

impl<O: PortOpener> fmt::Debug for FlashSession<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashSession")
            .field("state", &self.state)
            .field("chip", &self.chip())
            .field("stub", &self.is_stub())
            .field(
                "port",
                &self
                    .loader
                    .as_ref()
                    .map(|l| l.port().name()),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::error::{MANUAL_RESET_HINT, PORT_BUSY_HINT};
    use crate::port::{SimHandle, SimPort};
    use crate::protocol::CommandType;

    fn fast_config() -> LoaderConfig {
        LoaderConfig::new()
            .with_reset_delay(Duration::ZERO)
            .with_boot_delay(Duration::ZERO)
    }

    fn session_for(
        handle: &SimHandle,
        config: LoaderConfig,
    ) -> FlashSession<impl FnMut() -> Result<SimPort>> {
        let handle = handle.clone();
        FlashSession::new(move || handle.open(), config)
            .with_environment(HostEnvironment::permissive())
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i % 253) as u8)
            .collect()
    }

    type Entries = Arc<Mutex<Vec<LogEntry>>>;

    fn capture() -> (Entries, impl FnMut(LogEntry) + Send + 'static) {
        let entries: Entries = Arc::default();
        let sink = Arc::clone(&entries);
        (entries, move |entry: LogEntry| sink.lock().unwrap().push(entry))
    }

    #[test]
    fn test_end_to_end_flash_in_four_blocks() {
        let _ = env_logger::builder()
            .is_test(true)
            .try_init();

        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let config = fast_config()
            .with_compress(false)
            .with_rom_block_size(16 * 1024);
        let mut session = session_for(&handle, config);

        assert_eq!(session.connect().unwrap(), ChipFamily::Esp32S3);
        assert_eq!(session.state(), SessionState::Connected);

        let data = image(64 * 1024);
        let mut percentages = Vec::new();
        session
            .flash(&[FlashFile::new(0x0, &data)], |p| {
                assert_eq!(p.file_index, 0);
                percentages.push(p.percentage());
            })
            .unwrap();

        assert_eq!(percentages, vec![25.0, 50.0, 75.0, 100.0]);
        assert_eq!(handle.flash(0, data.len()), data);
        assert_eq!(session.state(), SessionState::Connected);

        session.reset().unwrap();
        assert!(handle.app_started());

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.chip(), None);
        assert_eq!(session.baud_rate(), None);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_progress_restarts_per_file() {
        let handle = SimHandle::new(ChipFamily::Esp32C3);
        let mut session = session_for(&handle, fast_config());
        session.connect().unwrap();

        let first = image(10_000);
        let second = image(3_000);
        let mut seen: Vec<(usize, f32)> = Vec::new();
        session
            .flash(
                &[FlashFile::new(0x0, &first), FlashFile::new(0x10_000, &second)],
                |p| seen.push((p.file_index, p.percentage())),
            )
            .unwrap();

        for index in 0..2 {
            let values: Vec<f32> = seen
                .iter()
                .filter(|(i, _)| *i == index)
                .map(|(_, pct)| *pct)
                .collect();
            assert!(values.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(values.last(), Some(&100.0));
        }
        assert_eq!(handle.flash(0x10_000, second.len()), second);
    }

    #[test]
    fn test_operations_require_connection() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let mut session = session_for(&handle, fast_config());
        let data = image(16);

        let err = session
            .flash(&[FlashFile::new(0, &data)], |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                operation: "flash",
                ..
            }
        ));
        assert!(matches!(session.erase(), Err(Error::InvalidState { .. })));
        assert!(matches!(session.reset(), Err(Error::InvalidState { .. })));

        assert_eq!(handle.open_count(), 0);
        assert_eq!(handle.bytes_written(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_precondition_checked_before_opening() {
        let opened = Rc::new(Cell::new(0));
        let counter = Rc::clone(&opened);
        let handle = SimHandle::new(ChipFamily::Esp32);
        let mut session = FlashSession::new(
            move || {
                counter.set(counter.get() + 1);
                handle.open()
            },
            fast_config(),
        )
        .with_environment(HostEnvironment {
            serial_available: false,
            secure_context: true,
        });

        assert!(matches!(session.connect(), Err(Error::Precondition(_))));
        assert_eq!(opened.get(), 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_busy_port_reports_hint() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let _held = handle.open().unwrap();
        let (entries, sink) = capture();
        let mut session = session_for(&handle, fast_config()).with_log_sink(sink);

        let err = session.connect().unwrap_err();
        assert!(matches!(err, Error::PortUnavailable { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);

        let entries = entries.lock().unwrap();
        assert!(entries
            .iter()
            .any(|e| e.severity == Severity::Error));
        assert!(entries
            .iter()
            .any(|e| e.message == PORT_BUSY_HINT));
    }

    #[test]
    fn test_failed_connect_releases_port() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        handle.set_silent(true);
        let config = fast_config()
            .with_connect_attempts(2)
            .with_sync_attempts(1);
        let mut session = session_for(&handle, config);

        assert!(matches!(
            session.connect(),
            Err(Error::NoResponse { attempts: 2 })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!handle.is_open());

        handle.set_silent(false);
        assert!(session.connect().is_ok());
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let mut session = session_for(&handle, fast_config());
        session.connect().unwrap();
        session.connect().unwrap();

        assert_eq!(handle.open_count(), 2);
        assert!(handle.is_open());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_invalid_files_rejected_before_writing() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let config = fast_config().with_flash_size(Some(0x10_0000));
        let mut session = session_for(&handle, config);
        session.connect().unwrap();

        let data = image(0x2000);
        let misaligned = session.flash(&[FlashFile::new(0x800, &data)], |_| {});
        assert!(matches!(misaligned, Err(Error::InvalidImage(_))));

        let empty = session.flash(&[FlashFile::new(0, &[])], |_| {});
        assert!(matches!(empty, Err(Error::InvalidImage(_))));

        let too_big = session.flash(&[FlashFile::new(0xFF_000, &data)], |_| {});
        assert!(matches!(too_big, Err(Error::InvalidImage(_))));

        assert!(!handle
            .commands()
            .contains(&CommandType::FlashDeflBegin));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_block_failure_returns_to_connected() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let config = fast_config()
            .with_compress(false)
            .with_max_block_attempts(2);
        let mut session = session_for(&handle, config);
        session.connect().unwrap();
        handle.reject_next_blocks(5);

        let data = image(4096);
        let err = session
            .flash(&[FlashFile::new(0, &data)], |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::BlockRetriesExhausted { attempts: 2, .. }));
        assert_eq!(handle.data_attempts(0), 2);
        assert_eq!(session.state(), SessionState::Connected);

        handle.reject_next_blocks(0);
        session
            .flash(&[FlashFile::new(0, &data)], |_| {})
            .unwrap();
    }

    #[test]
    fn test_reset_failure_keeps_state() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let (entries, sink) = capture();
        let mut session = session_for(&handle, fast_config()).with_log_sink(sink);
        session.connect().unwrap();

        handle.fail_control_lines(true);
        let err = session.reset().unwrap_err();
        assert!(matches!(err, Error::ResetFailure { .. }));
        assert_eq!(err.hint(), Some(MANUAL_RESET_HINT));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.message == MANUAL_RESET_HINT));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let mut session = session_for(&handle, fast_config());
        session.disconnect();
        session.connect().unwrap();

        handle.break_link();
        session.disconnect();
        session.disconnect();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_disconnect_without_reset_stays_in_bootloader() {
        let handle = SimHandle::new(ChipFamily::Esp32C3);
        let mut session = session_for(&handle, fast_config()).with_reset_on_disconnect(false);
        session.connect().unwrap();

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!handle.app_started());
        assert!(!handle.is_open());
    }

    #[test]
    fn test_erase_with_stub() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let stub = FlashStub::new(0x4037_8000, 0x4037_7000, vec![0; 256], 0x3FC9_0000, vec![0; 16]);
        let mut session = session_for(&handle, fast_config()).with_stub(Some(stub));

        session.connect().unwrap();
        assert!(session.is_stub());
        session.erase().unwrap();
        assert!(handle
            .commands()
            .contains(&CommandType::EraseFlash));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_rom_erase_with_default_config() {
        let handle = SimHandle::new(ChipFamily::Esp32C3);
        let mut session = session_for(&handle, fast_config().with_compress(false));
        session.connect().unwrap();
        assert!(!session.is_stub());
        assert_eq!(session.flash_size(), Some(4 * 1024 * 1024));

        session
            .flash(&[FlashFile::new(0x20_000, &image(512))], |_| {})
            .unwrap();
        session.erase().unwrap();

        assert_eq!(handle.flash(0x20_000, 512), vec![0xFF; 512]);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_failed_erase_returns_to_connected() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        handle.set_jedec_id(0x00ff_ffff);
        let (entries, sink) = capture();
        let mut session = session_for(&handle, fast_config()).with_log_sink(sink);
        session.connect().unwrap();

        assert!(matches!(session.erase(), Err(Error::Unsupported(_))));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.severity == Severity::Error));

        handle.break_link();
        assert!(session.erase().is_err());
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_connect_reports_mac_address() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let (entries, sink) = capture();
        let mut session = session_for(&handle, fast_config()).with_log_sink(sink);
        assert_eq!(session.mac_address(), None);

        session.connect().unwrap();
        assert_eq!(session.mac_address(), Some("24:0a:c4:5e:12:9f"));
        assert!(entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.severity == Severity::Success && e.message.ends_with("MAC 24:0a:c4:5e:12:9f)")));

        session.disconnect();
        assert_eq!(session.mac_address(), None);
    }
}
