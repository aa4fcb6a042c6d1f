//! ESP32 ROM / stub loader driver.
//!
//! [`EspLoader`] owns a [`Port`] and speaks the bootloader protocol on it:
//! reset into download mode, SYNC, chip detection, optional stub upload and
//! ACK-gated block transfers.
//!
//! ## Example
//!
//! ```rust
//! use meshflash::port::SimHandle;
//! use meshflash::target::{ChipFamily, EspLoader, LoaderConfig};
//!
//! fn main() -> meshflash::Result<()> {
//!     let device = SimHandle::new(ChipFamily::Esp32S3);
//!     let config = LoaderConfig::new().with_reset_delay(std::time::Duration::ZERO);
//!     let mut loader = EspLoader::new(device.open()?, config);
//!
//!     let chip = loader.connect(None)?;
//!     assert_eq!(chip, ChipFamily::Esp32S3);
//!
//!     loader.write_flash(0x0, &[0xAA; 4096], &mut |written, total| {
//!         println!("{written}/{total}");
//!     })?;
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use log::{debug, info, trace, warn};
use md5::{Digest, Md5};

use super::reset::{ResetStrategy, hard_reset};
use super::stub::{FlashStub, MEM_WRITE_SIZE, STUB_HANDSHAKE};
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::response::{ROM_STATUS_LEN, STUB_STATUS_LEN};
use crate::protocol::slip::SlipDecoder;
use crate::protocol::{
    Command, CommandType, DEFAULT_TIMEOUT, FLASH_DEFLATE_END_TIMEOUT, Response, SYNC_TIMEOUT,
};
use crate::target::{
    CHIP_DETECT_MAGIC_REG_ADDR, ChipFamily, LoaderConfig, SPI_CMD_USR, SPI_FLASH_RDID,
    flash_size_from_capacity,
};

/// Longest single blocking read while waiting for a frame.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay after changing baud rate.
const BAUD_CHANGE_DELAY: Duration = Duration::from_millis(50);

/// Polls of the SPI command register before a flash command times out.
const SPI_COMMAND_POLLS: usize = 10;

/// Capacity byte of a JEDEC ID read from a blank or absent flash chip.
const BLANK_CAPACITY: u8 = 0xff;

/// ESP32-family bootloader driver.
///
/// Generic over the port type `P`, so the same driver runs on a native
/// serial port or the simulated device.
pub struct EspLoader<P: Port> {
    port: P,
    config: LoaderConfig,
    decoder: SlipDecoder,
    frames: VecDeque<Vec<u8>>,
    chip: Option<ChipFamily>,
    mac: Option<String>,
    stub: bool,
    usb_pid: Option<u16>,
}

impl<P: Port> EspLoader<P> {
    /// Create a loader on an opened port.
    pub fn new(port: P, config: LoaderConfig) -> Self {
        Self {
            port,
            config,
            decoder: SlipDecoder::new(),
            frames: VecDeque::new(),
            chip: None,
            mac: None,
            stub: false,
            usb_pid: None,
        }
    }

    /// Record the USB product ID to pick the matching reset sequence.
    #[must_use]
    pub fn with_usb_pid(mut self, pid: Option<u16>) -> Self {
        self.usb_pid = pid;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the loader and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Chip detected by [`EspLoader::connect`].
    pub fn chip(&self) -> Option<ChipFamily> {
        self.chip
    }

    /// Factory MAC address read during [`EspLoader::connect`], if it could
    /// be read.
    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    /// Flash size in bytes, as configured or detected on connect.
    pub fn flash_size(&self) -> Option<u32> {
        self.config.flash_size
    }

    /// Whether commands are answered by the stub rather than the ROM.
    pub fn is_stub(&self) -> bool {
        self.stub
    }

    /// Current baud rate of the link.
    pub fn baud_rate(&self) -> u32 {
        self.port.baud_rate()
    }

    /// Data block size for the current loader.
    pub fn block_size(&self) -> u32 {
        if self.stub {
            self.config.stub_block_size
        } else {
            self.config.rom_block_size
        }
    }

    /// Connect to the bootloader.
    ///
    /// Resets the chip into download mode and syncs, up to
    /// `connect_attempts` rounds; then detects the chip and reads its MAC,
    /// uploads `stub` if given (staying with the ROM if that fails), attaches
    /// the SPI flash and switches baud rate if configured.
    pub fn connect(&mut self, stub: Option<&FlashStub>) -> Result<ChipFamily> {
        info!("Connecting to bootloader on {}...", self.port.name());
        self.connect_rounds()?;

        let chip = self.detect_chip()?;
        info!("Detected {chip}");

        self.mac = match self.mac_address() {
            Ok(mac) => {
                info!("MAC address: {mac}");
                Some(mac)
            },
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(e) => {
                warn!("Could not read MAC address: {e}");
                None
            },
        };

        if let Some(stub) = stub {
            match self.load_stub(stub) {
                Ok(()) => info!("Flasher stub running"),
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => {
                    warn!("Stub upload failed ({e}); continuing with the ROM loader");
                    self.recover_rom()?;
                },
            }
        }

        self.attach_flash()?;

        if let Some(baud) = self.config.target_baud {
            if baud != self.port.baud_rate() {
                self.change_baud(baud)?;
            }
        }

        Ok(chip)
    }

    /// Reset + sync rounds, cycling through the reset strategies.
    fn connect_rounds(&mut self) -> Result<()> {
        let attempts = self.config.connect_attempts;
        let strategies = ResetStrategy::sequence(self.usb_pid);

        for (attempt, strategy) in (1..=attempts).zip(strategies.iter().cycle()) {
            match self.connect_attempt(*strategy) {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("Synced on attempt {attempt}");
                    }
                    return Ok(());
                },
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => {
                    warn!("Connection failed (attempt {attempt}/{attempts}): {e}");
                },
            }
        }

        Err(Error::NoResponse { attempts })
    }

    /// Single reset + sync round.
    fn connect_attempt(&mut self, strategy: ResetStrategy) -> Result<()> {
        if let Err(e) =
            strategy.enter_bootloader(&mut self.port, self.config.reset_delay, self.config.boot_delay)
        {
            // The board may lack auto-reset wiring and already sit in the
            // bootloader, so keep trying to sync.
            debug!("Reset into bootloader failed: {e}");
        }
        self.stub = false;

        let mut last = None;
        for _ in 0..self.config.sync_attempts {
            match self.sync() {
                Ok(()) => return Ok(()),
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or_else(|| Error::Timeout("no SYNC reply".into())))
    }

    /// Send one SYNC and wait for its reply.
    fn sync(&mut self) -> Result<()> {
        self.command(&Command::sync(), SYNC_TIMEOUT)?;

        // The ROM answers one SYNC several times; drop the extra replies.
        let deadline = Instant::now() + SYNC_TIMEOUT;
        while self.next_frame(deadline)?.is_some() {}
        trace!("SYNC ok");
        Ok(())
    }

    /// Read the magic register and classify the chip.
    pub fn detect_chip(&mut self) -> Result<ChipFamily> {
        let magic = self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        let chip = ChipFamily::from_magic(magic)
            .ok_or_else(|| Error::Unsupported(format!("unknown chip magic value 0x{magic:08X}")))?;
        self.chip = Some(chip);
        Ok(chip)
    }

    /// Read a 32-bit register.
    pub fn read_reg(&mut self, address: u32) -> Result<u32> {
        Ok(self
            .command(&Command::read_reg(address), DEFAULT_TIMEOUT)?
            .value)
    }

    /// Write a 32-bit register.
    pub fn write_reg(&mut self, address: u32, value: u32) -> Result<()> {
        self.command(&Command::write_reg(address, value), DEFAULT_TIMEOUT)?;
        Ok(())
    }

    /// Read the factory MAC address from eFuse, formatted `aa:bb:cc:dd:ee:ff`.
    pub fn mac_address(&mut self) -> Result<String> {
        let chip = self
            .chip
            .ok_or_else(|| Error::Protocol("mac_address before connect".into()))?;
        let (low, high) = chip.mac_efuse_words();
        let base = chip.efuse_base();
        let low = self.read_reg(base + low * 4)?;
        let high = self.read_reg(base + high * 4)?;

        let bytes = ((u64::from(high) << 32) | u64::from(low)).to_be_bytes();
        Ok(bytes[2..]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":"))
    }

    /// Upload `stub` to RAM, start it and wait for its greeting.
    pub fn load_stub(&mut self, stub: &FlashStub) -> Result<()> {
        debug!("Uploading flasher stub");
        for (address, bytes) in stub.segments() {
            self.mem_write(address, bytes)?;
        }

        self.send(&Command::mem_end(stub.entry()))?;

        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        while let Some(frame) = self.next_frame(deadline)? {
            if frame == STUB_HANDSHAKE {
                self.stub = true;
                return Ok(());
            }
            if let Ok(resp) = Response::parse(&frame, ROM_STATUS_LEN) {
                if resp.answers(CommandType::MemEnd) {
                    resp.check(CommandType::MemEnd)?;
                }
            }
        }

        Err(Error::Protocol("stub did not send its greeting".into()))
    }

    /// Write `data` to RAM at `address`.
    fn mem_write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let size = len_u32(data.len())?;
        let blocks = size.div_ceil(MEM_WRITE_SIZE);
        self.command(
            &Command::begin(CommandType::MemBegin, size, blocks, MEM_WRITE_SIZE, address, false),
            DEFAULT_TIMEOUT,
        )?;

        for (seq, chunk) in data
            .chunks(MEM_WRITE_SIZE as usize)
            .enumerate()
        {
            let cmd = Command::data(CommandType::MemData, chunk, len_u32(seq)?, 0);
            self.command(&cmd, DEFAULT_TIMEOUT)?;
        }
        Ok(())
    }

    /// Make sure the ROM is answering after a failed stub upload.
    fn recover_rom(&mut self) -> Result<()> {
        self.stub = false;
        self.discard_input()?;
        if self.sync().is_ok() {
            return Ok(());
        }
        debug!("ROM did not answer after stub failure, resetting");
        self.connect_rounds()?;
        self.detect_chip()?;
        Ok(())
    }

    /// SPI_ATTACH, then SPI_SET_PARAMS with the configured flash size, or
    /// the one read from the flash chip's JEDEC ID when none is configured.
    pub fn attach_flash(&mut self) -> Result<()> {
        self.command(&Command::spi_attach(self.stub), DEFAULT_TIMEOUT)?;

        if self.config.flash_size.is_none() {
            match self.detect_flash_size() {
                Ok(Some(size)) => {
                    info!("Detected {} MB flash", size / (1024 * 1024));
                    self.config.flash_size = Some(size);
                },
                Ok(None) => warn!("Could not detect the flash size"),
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(e) => warn!("Flash size detection failed: {e}"),
            }
        }

        if let Some(size) = self.config.flash_size {
            self.command(&Command::spi_set_params(size), DEFAULT_TIMEOUT)?;
        }
        Ok(())
    }

    /// Read the flash chip's JEDEC ID and decode its capacity byte.
    ///
    /// `Ok(None)` when the ID is blank or names an unknown capacity.
    pub fn detect_flash_size(&mut self) -> Result<Option<u32>> {
        let flash_id = self.spi_command(SPI_FLASH_RDID, 24)?;
        let capacity = flash_id.to_le_bytes()[2];
        if capacity == BLANK_CAPACITY {
            return Ok(None);
        }

        let size = flash_size_from_capacity(capacity);
        if size.is_none() {
            debug!("Unknown flash capacity 0x{capacity:02X} (JEDEC ID 0x{flash_id:06X})");
        }
        Ok(size)
    }

    /// Run a flash opcode through the SPI controller's user command
    /// registers and return up to 32 bits of its reply.
    fn spi_command(&mut self, opcode: u8, read_bits: u32) -> Result<u32> {
        let chip = self
            .chip
            .ok_or_else(|| Error::Protocol("SPI command before connect".into()))?;
        let regs = chip.spi_registers();

        let old_usr = self.read_reg(regs.usr())?;
        let old_usr2 = self.read_reg(regs.usr2())?;

        // USR_COMMAND, plus USR_MISO when reading a reply.
        let mut flags = 1 << 31;
        if read_bits > 0 {
            flags |= 1 << 28;
        }
        self.write_reg(regs.usr(), flags)?;
        self.write_reg(regs.usr2(), (7 << 28) | u32::from(opcode))?;
        self.write_reg(regs.mosi_length(), 0)?;
        if read_bits > 0 {
            self.write_reg(regs.miso_length(), read_bits - 1)?;
        }
        self.write_reg(regs.w0(), 0)?;
        self.write_reg(regs.cmd(), SPI_CMD_USR)?;

        let mut polls = 0;
        while self.read_reg(regs.cmd())? & SPI_CMD_USR != 0 {
            polls += 1;
            if polls >= SPI_COMMAND_POLLS {
                return Err(Error::Timeout(format!("SPI flash command 0x{opcode:02X} did not complete")));
            }
            thread::sleep(Duration::from_millis(1));
        }

        let result = self.read_reg(regs.w0())?;
        self.write_reg(regs.usr(), old_usr)?;
        self.write_reg(regs.usr2(), old_usr2)?;
        Ok(result)
    }

    /// Switch the link to `baud`.
    pub fn change_baud(&mut self, baud: u32) -> Result<()> {
        info!("Changing baud rate to {baud}");
        let prior = if self.stub { self.port.baud_rate() } else { 0 };
        self.command(&Command::change_baudrate(baud, prior), DEFAULT_TIMEOUT)?;

        self.port.set_baud_rate(baud)?;
        thread::sleep(BAUD_CHANGE_DELAY);
        self.discard_input()?;

        debug!("Baud rate changed to {baud}");
        Ok(())
    }

    /// Write `data` to flash at `address`.
    ///
    /// `progress` is called after every acknowledged block with
    /// `(bytes_written, total_bytes)` in image bytes; the last call reports
    /// `total_bytes`. A block rejected more than `max_block_attempts` times
    /// aborts the whole image.
    pub fn write_flash(
        &mut self,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let chip = self
            .chip
            .ok_or_else(|| Error::Protocol("write_flash before connect".into()))?;
        self.config.validate()?;
        let size = len_u32(data.len())?;
        let block_size = self.block_size();
        let encryption_word = !self.stub && chip.supports_encryption();

        info!(
            "Writing {} bytes at 0x{address:08X} ({}, {} byte blocks)",
            data.len(),
            if self.config.compress { "compressed" } else { "uncompressed" },
            block_size
        );

        let mut hasher = Md5::new();
        if self.config.compress {
            self.write_deflated(address, data, block_size, encryption_word, &mut hasher, progress)?;
        } else {
            self.write_plain(address, data, block_size, encryption_word, &mut hasher, progress)?;
        }

        if self.stub {
            // The stub ACKs blocks before they reach flash; this read is only
            // answered once the last one is written.
            self.command(&Command::read_reg(CHIP_DETECT_MAGIC_REG_ADDR), FLASH_DEFLATE_END_TIMEOUT)?;
        }

        if self.config.verify {
            let expected: [u8; 16] = hasher.finalize().into();
            let actual = self.flash_md5(address, size)?;
            if expected != actual {
                return Err(Error::VerifyFailed {
                    address,
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
            debug!("MD5 verified for 0x{address:08X}");
        }

        Ok(())
    }

    fn write_plain(
        &mut self,
        address: u32,
        data: &[u8],
        block_size: u32,
        encryption_word: bool,
        hasher: &mut Md5,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let size = len_u32(data.len())?;
        let blocks = size.div_ceil(block_size);
        self.command(
            &Command::begin(CommandType::FlashBegin, size, blocks, block_size, address, encryption_word),
            CommandType::FlashBegin.timeout_for_size(size),
        )?;

        let timeout = CommandType::FlashData.timeout_for_size(block_size);
        let mut written = 0;
        for (seq, chunk) in data
            .chunks(block_size as usize)
            .enumerate()
        {
            check_interrupted()?;
            self.write_block(CommandType::FlashData, chunk, len_u32(seq)?, block_size as usize, timeout)?;
            hasher.update(chunk);
            written += chunk.len();
            progress(written, data.len());
        }
        Ok(())
    }

    fn write_deflated(
        &mut self,
        address: u32,
        data: &[u8],
        block_size: u32,
        encryption_word: bool,
        hasher: &mut Md5,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let size = len_u32(data.len())?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        debug!("Compressed {} bytes to {}", data.len(), compressed.len());

        let blocks = len_u32(compressed.len())?.div_ceil(block_size);
        // The stub wants the uncompressed size; the ROM wants whole erase blocks.
        let erase_size = if self.stub {
            size
        } else {
            size.div_ceil(block_size) * block_size
        };
        self.command(
            &Command::begin(
                CommandType::FlashDeflBegin,
                erase_size,
                blocks,
                block_size,
                address,
                encryption_word,
            ),
            CommandType::FlashDeflBegin.timeout_for_size(erase_size),
        )?;

        // Inflate locally to report progress in image bytes.
        let mut inflater = ZlibDecoder::new(Vec::new());
        let mut written = 0;
        let chunks = compressed.chunks(block_size as usize);
        let last = chunks.len().saturating_sub(1);
        for (seq, chunk) in chunks.enumerate() {
            check_interrupted()?;

            inflater.write_all(chunk)?;
            if seq == last {
                inflater.try_finish()?;
            }
            let decoded = std::mem::take(inflater.get_mut());

            let timeout = CommandType::FlashDeflData.timeout_for_size(len_u32(decoded.len())?);
            self.write_block(CommandType::FlashDeflData, chunk, len_u32(seq)?, 0, timeout)?;

            hasher.update(&decoded);
            written = (written + decoded.len()).min(data.len());
            if seq == last {
                written = data.len();
            }
            progress(written, data.len());
        }
        Ok(())
    }

    /// Send one data block, resending it while the loader rejects it.
    fn write_block(
        &mut self,
        op: CommandType,
        block: &[u8],
        sequence: u32,
        pad_to: usize,
        timeout: Duration,
    ) -> Result<()> {
        let cmd = Command::data(op, block, sequence, pad_to);
        let max = self.config.max_block_attempts;
        let mut last = None;

        for attempt in 1..=max {
            match self.command(&cmd, timeout) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_block_rejection() => {
                    warn!("Block {sequence} rejected (attempt {attempt}/{max}): {e}");
                    last = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::BlockRetriesExhausted {
            sequence,
            attempts: max,
            last: last.map_or_else(|| "no answer".to_string(), |e| e.to_string()),
        })
    }

    /// Leave flash mode without rebooting. Only the stub needs this; the ROM
    /// would jump to the application on FLASH_END.
    pub fn finish_flash(&mut self) -> Result<()> {
        if !self.stub {
            return Ok(());
        }
        let block_size = self.block_size();
        self.command(
            &Command::begin(CommandType::FlashBegin, 0, 0, block_size, 0, false),
            DEFAULT_TIMEOUT,
        )?;
        let end = if self.config.compress {
            CommandType::FlashDeflEnd
        } else {
            CommandType::FlashEnd
        };
        self.command(&Command::end(end, false), end.timeout())?;
        Ok(())
    }

    /// MD5 of `size` bytes of flash at `address`, computed on the device.
    pub fn flash_md5(&mut self, address: u32, size: u32) -> Result<[u8; 16]> {
        self.command(
            &Command::flash_md5(address, size),
            CommandType::FlashMd5.timeout_for_size(size),
        )?
        .md5()
    }

    /// Erase the whole flash.
    ///
    /// The stub has a dedicated command. The ROM does not, so without the
    /// stub the erase goes through FLASH_BEGIN over the known flash size.
    pub fn erase_flash(&mut self) -> Result<()> {
        info!("Erasing entire flash...");
        let started = Instant::now();

        if self.stub {
            self.command(&Command::erase_flash(), CommandType::EraseFlash.timeout())?;
        } else {
            let Some(size) = self.config.flash_size else {
                return Err(Error::Unsupported(
                    "full-chip erase without the flasher stub needs a known flash size".into(),
                ));
            };
            let encryption_word = self
                .chip
                .is_some_and(|c| c.supports_encryption());
            self.command(
                &Command::begin(
                    CommandType::FlashBegin,
                    size,
                    0,
                    self.config.rom_block_size,
                    0,
                    encryption_word,
                ),
                CommandType::FlashBegin.timeout_for_size(size),
            )?;
        }

        info!("Flash erased in {:.1}s", started.elapsed().as_secs_f32());
        Ok(())
    }

    /// Reset the chip into the application.
    pub fn hard_reset(&mut self) -> Result<()> {
        hard_reset(&mut self.port, self.config.reset_delay)?;
        self.stub = false;
        Ok(())
    }

    /// Close the port and release resources.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    /// Send `cmd` and wait for its response.
    fn command(&mut self, cmd: &Command, timeout: Duration) -> Result<Response> {
        self.send(cmd)?;
        self.wait_response(cmd.command_type(), timeout)
    }

    fn send(&mut self, cmd: &Command) -> Result<()> {
        self.discard_input()?;
        let data = cmd.encode()?;
        trace!("Sending {}: {} bytes", cmd.command_type(), data.len());
        self.port.write_all_bytes(&data)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.frames.clear();
        self.decoder.reset();
        self.port.clear_buffers()
    }

    /// Wait for the response to `op`, skipping stale or foreign frames.
    fn wait_response(&mut self, op: CommandType, timeout: Duration) -> Result<Response> {
        let status_len = if self.stub { STUB_STATUS_LEN } else { ROM_STATUS_LEN };
        let deadline = Instant::now() + timeout;

        while let Some(frame) = self.next_frame(deadline)? {
            match Response::parse(&frame, status_len) {
                Ok(resp) if resp.answers(op) => return resp.check(op),
                Ok(resp) => trace!("Skipping stale response to 0x{:02X}", resp.op),
                Err(e) => trace!("Skipping frame: {e}"),
            }
        }

        Err(Error::Timeout(format!(
            "no response to {op} within {}ms",
            timeout.as_millis()
        )))
    }

    /// Next complete frame, or `None` once `deadline` passes.
    fn next_frame(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(Some(frame));
            }
            check_interrupted()?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            let n = self.port.read_with_timeout(&mut buf, wait)?;
            if n > 0 {
                trace!("Received {n} bytes");
                self.frames
                    .extend(self.decoder.feed_all(&buf[..n]));
            }
        }
    }
}

fn check_interrupted() -> Result<()> {
    if crate::is_interrupted_requested() {
        return Err(Error::Interrupted);
    }
    Ok(())
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidImage(format!("{len} bytes exceeds the 4 GiB address space")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{SimHandle, SimPort};
    use crate::target::MAX_FLASH_WRITE_SIZE;

    fn fast_config() -> LoaderConfig {
        LoaderConfig::new()
            .with_reset_delay(Duration::ZERO)
            .with_boot_delay(Duration::ZERO)
    }

    fn connected(chip: ChipFamily, config: LoaderConfig) -> (SimHandle, EspLoader<SimPort>) {
        let handle = SimHandle::new(chip);
        let mut loader = EspLoader::new(handle.open().unwrap(), config);
        loader.connect(None).unwrap();
        (handle, loader)
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (i * 31 % 251) as u8)
            .collect()
    }

    fn test_stub() -> FlashStub {
        FlashStub::new(0x4037_8000, 0x4037_7000, vec![0x11; 0x2000], 0x3FC9_0000, vec![0x22; 64])
    }

    #[test]
    fn test_connect_detects_chip() {
        let (handle, loader) = connected(ChipFamily::Esp32C3, fast_config());
        assert_eq!(loader.chip(), Some(ChipFamily::Esp32C3));
        assert!(!loader.is_stub());
        assert!(handle
            .commands()
            .contains(&CommandType::SpiAttach));
    }

    #[test]
    fn test_connect_retries_sync() {
        let handle = SimHandle::new(ChipFamily::Esp32);
        handle.fail_syncs(6);
        let mut loader = EspLoader::new(handle.open().unwrap(), fast_config());
        assert_eq!(loader.connect(None).unwrap(), ChipFamily::Esp32);
    }

    #[test]
    fn test_silent_device_is_no_response() {
        let handle = SimHandle::new(ChipFamily::Esp32);
        handle.set_silent(true);
        let config = fast_config()
            .with_connect_attempts(2)
            .with_sync_attempts(1);
        let mut loader = EspLoader::new(handle.open().unwrap(), config);

        let err = loader.connect(None).unwrap_err();
        assert!(matches!(err, Error::NoResponse { attempts: 2 }));
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_plain_write_lands_and_verifies() {
        let config = fast_config().with_compress(false);
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        let data = image(5000);

        let mut calls = Vec::new();
        loader
            .write_flash(0x1_0000, &data, &mut |w, t| calls.push((w, t)))
            .unwrap();

        assert_eq!(handle.flash(0x1_0000, data.len()), data);
        assert_eq!(calls.len(), 5);
        assert_eq!(calls.last(), Some(&(5000, 5000)));
        assert!(handle
            .commands()
            .contains(&CommandType::FlashMd5));
    }

    #[test]
    fn test_compressed_write_reports_image_bytes() {
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, fast_config());
        let data = image(64 * 1024);

        let mut last = (0, 0);
        let mut monotonic = true;
        loader
            .write_flash(0, &data, &mut |w, t| {
                monotonic &= w >= last.0;
                last = (w, t);
            })
            .unwrap();

        assert!(monotonic);
        assert_eq!(last, (data.len(), data.len()));
        assert_eq!(handle.flash(0, data.len()), data);
        assert!(handle
            .commands()
            .contains(&CommandType::FlashDeflData));
    }

    #[test]
    fn test_esp32_begin_omits_encryption_word() {
        let config = fast_config().with_compress(false);
        let (handle, mut loader) = connected(ChipFamily::Esp32, config);
        loader
            .write_flash(0, &image(100), &mut |_, _| {})
            .unwrap();
        assert_eq!(handle.flash(0, 100), image(100));
    }

    #[test]
    fn test_block_retry_succeeds_below_bound() {
        let config = fast_config()
            .with_compress(false)
            .with_max_block_attempts(3);
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        handle.reject_next_blocks(2);

        loader
            .write_flash(0, &image(1024), &mut |_, _| {})
            .unwrap();
        assert_eq!(handle.data_attempts(0), 3);
    }

    #[test]
    fn test_compressed_block_retry_succeeds_below_bound() {
        let config = fast_config().with_max_block_attempts(3);
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        handle.reject_next_blocks(2);

        let data = image(8192);
        loader
            .write_flash(0, &data, &mut |_, _| {})
            .unwrap();
        assert_eq!(handle.data_attempts(0), 3);
        assert_eq!(handle.flash(0, data.len()), data);
        assert!(handle
            .commands()
            .contains(&CommandType::FlashDeflData));
    }

    #[test]
    fn test_block_retry_exhaustion_aborts() {
        let config = fast_config()
            .with_compress(false)
            .with_max_block_attempts(3);
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        handle.reject_next_blocks(3);

        let err = loader
            .write_flash(0, &image(4096), &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(
            err,
            Error::BlockRetriesExhausted {
                sequence: 0,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(handle.data_attempts(0), 3);
        assert_eq!(handle.data_attempts(1), 0);
    }

    #[test]
    fn test_stub_upload_switches_block_size() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let mut loader = EspLoader::new(handle.open().unwrap(), fast_config());
        loader
            .connect(Some(&test_stub()))
            .unwrap();

        assert!(loader.is_stub());
        assert!(handle.is_stub());
        assert_eq!(loader.block_size(), 0x4000);

        let data = image(40_000);
        loader
            .write_flash(0, &data, &mut |_, _| {})
            .unwrap();
        loader.finish_flash().unwrap();
        assert_eq!(handle.flash(0, data.len()), data);
    }

    #[test]
    fn test_stub_failure_falls_back_to_rom() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        handle.refuse_stub(true);
        let mut loader = EspLoader::new(handle.open().unwrap(), fast_config());

        assert_eq!(
            loader
                .connect(Some(&test_stub()))
                .unwrap(),
            ChipFamily::Esp32S3
        );
        assert!(!loader.is_stub());
        assert_eq!(loader.block_size(), 0x400);
    }

    #[test]
    fn test_connect_detects_flash_size() {
        let handle = SimHandle::with_flash_size(ChipFamily::Esp32S3, 8 * 1024 * 1024);
        let mut loader = EspLoader::new(handle.open().unwrap(), fast_config());
        loader.connect(None).unwrap();

        assert_eq!(loader.flash_size(), Some(8 * 1024 * 1024));
        assert!(handle
            .commands()
            .contains(&CommandType::SpiSetParams));
        // The SPI user registers are put back afterwards.
        let spi = ChipFamily::Esp32S3.spi_registers();
        assert_eq!(handle.register(spi.usr()), Some(0));
        assert_eq!(handle.register(spi.usr2()), Some(0));
    }

    #[test]
    fn test_configured_flash_size_skips_detection() {
        let config = fast_config().with_flash_size(Some(0x10_0000));
        let (handle, loader) = connected(ChipFamily::Esp32C3, config);
        assert_eq!(loader.flash_size(), Some(0x10_0000));
        assert!(!handle
            .commands()
            .contains(&CommandType::WriteReg));
    }

    #[test]
    fn test_rom_erase_with_detected_size() {
        let config = fast_config().with_compress(false);
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        loader
            .write_flash(0x3F_F000, &[0u8; 16], &mut |_, _| {})
            .unwrap();

        loader.erase_flash().unwrap();
        assert!(!loader.is_stub());
        assert_eq!(handle.flash(0x3F_F000, 16), vec![0xFF; 16]);
    }

    #[test]
    fn test_erase_without_stub_or_size_is_unsupported() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        handle.set_jedec_id(0x00ff_ffff);
        let mut loader = EspLoader::new(handle.open().unwrap(), fast_config());
        loader.connect(None).unwrap();

        assert_eq!(loader.flash_size(), None);
        assert!(matches!(loader.erase_flash(), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_connect_reads_mac_address() {
        for chip in [ChipFamily::Esp32, ChipFamily::Esp32C2, ChipFamily::Esp32S3] {
            let (_handle, mut loader) = connected(chip, fast_config());
            assert_eq!(loader.mac(), Some("24:0a:c4:5e:12:9f"));
            assert_eq!(loader.mac_address().unwrap(), "24:0a:c4:5e:12:9f");
        }
    }

    #[test]
    fn test_zero_block_size_is_config_error() {
        let mut config = fast_config().with_compress(false);
        config.rom_block_size = 0;
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);

        let err = loader
            .write_flash(0, &image(64), &mut |_, _| {})
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!handle
            .commands()
            .contains(&CommandType::FlashBegin));
    }

    #[test]
    fn test_oversized_block_size_is_clamped() {
        let config = fast_config()
            .with_compress(false)
            .with_rom_block_size(0x1_0000);
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        assert_eq!(loader.block_size(), MAX_FLASH_WRITE_SIZE);

        let data = image(0x1_0000);
        loader
            .write_flash(0, &data, &mut |_, _| {})
            .unwrap();
        assert_eq!(handle.flash(0, data.len()), data);
        assert_eq!(handle.data_attempts(1), 1);
    }

    #[test]
    fn test_stub_erase_clears_flash() {
        let handle = SimHandle::new(ChipFamily::Esp32S3);
        let mut loader = EspLoader::new(handle.open().unwrap(), fast_config().with_compress(false));
        loader
            .connect(Some(&test_stub()))
            .unwrap();
        loader
            .write_flash(0, &[0u8; 16], &mut |_, _| {})
            .unwrap();

        loader.erase_flash().unwrap();
        assert_eq!(handle.flash(0, 16), vec![0xFF; 16]);
    }

    #[test]
    fn test_rom_erase_with_known_size() {
        let config = fast_config()
            .with_compress(false)
            .with_flash_size(Some(0x10_0000));
        let (handle, mut loader) = connected(ChipFamily::Esp32S3, config);
        loader
            .write_flash(0x2000, &[0u8; 16], &mut |_, _| {})
            .unwrap();

        loader.erase_flash().unwrap();
        assert_eq!(handle.flash(0x2000, 16), vec![0xFF; 16]);
        assert!(handle
            .commands()
            .contains(&CommandType::SpiSetParams));
    }

    #[test]
    fn test_change_baud_updates_both_ends() {
        let config = fast_config().with_target_baud(Some(921_600));
        let (handle, loader) = connected(ChipFamily::Esp32S3, config);
        assert_eq!(loader.baud_rate(), 921_600);
        assert_eq!(handle.device_baud(), 921_600);
    }

    #[test]
    fn test_interrupt_stops_transfer() {
        let config = fast_config().with_compress(false);
        let (_handle, mut loader) = connected(ChipFamily::Esp32S3, config);

        crate::test_set_interrupted(true);
        let result = loader.write_flash(0, &image(2048), &mut |_, _| {});
        crate::test_set_interrupted(false);

        assert!(matches!(result, Err(Error::Interrupted)));
    }
}
