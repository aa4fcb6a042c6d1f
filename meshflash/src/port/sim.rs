//! In-memory ESP bootloader for exercising the driver without hardware.
//!
//! [`SimPort`] decodes the SLIP frames written to it and answers like the
//! ROM loader (or the stub, once one has been "uploaded"), backed by a
//! simulated flash array. A [`SimHandle`] shares the same state, so a test
//! can inject faults and inspect what reached the device after the port has
//! been handed to a session.
//!
//! ```rust
//! use meshflash::port::SimHandle;
//! use meshflash::target::ChipFamily;
//!
//! let handle = SimHandle::new(ChipFamily::Esp32S3);
//! handle.reject_next_blocks(2);
//! let port = handle.open().unwrap();
//! # drop(port);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use flate2::write::ZlibDecoder;
use log::trace;
use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::response::{ROM_STATUS_LEN, STUB_STATUS_LEN, build_response};
use crate::protocol::{CommandType, RomErrorKind, checksum, slip};
use crate::target::esp32::stub::STUB_HANDSHAKE;
use crate::target::{
    CHIP_DETECT_MAGIC_REG_ADDR, ChipFamily, FLASH_SECTOR_SIZE, SPI_CMD_USR, SPI_FLASH_RDID,
};

/// Number of replies the ROM sends to one SYNC.
const SYNC_REPLIES: usize = 8;

/// Default simulated flash size (4 MiB).
pub const DEFAULT_SIM_FLASH_SIZE: usize = 4 * 1024 * 1024;

/// Factory MAC burned into every simulated chip.
pub const SIM_MAC: [u8; 6] = [0x24, 0x0a, 0xc4, 0x5e, 0x12, 0x9f];

/// JEDEC ID of a flash chip with `size` bytes: a Winbond part whose
/// capacity byte is log2 of the size.
fn jedec_id(size: usize) -> u32 {
    let capacity = usize::BITS - 1 - size.max(1).leading_zeros();
    0xef | (0x40 << 8) | (capacity << 16)
}

enum Transfer {
    Idle,
    Flash {
        offset: u32,
        block_size: u32,
        next_seq: u32,
        inflater: Option<ZlibDecoder<Vec<u8>>>,
        written: usize,
    },
    Mem,
}

struct SimState {
    chip: ChipFamily,
    flash: Vec<u8>,
    decoder: slip::SlipDecoder,
    rx: VecDeque<u8>,
    stub: bool,
    transfer: Transfer,
    device_baud: u32,
    dtr: bool,
    rts: bool,
    registers: HashMap<u32, u32>,
    jedec_id: u32,

    // Faults
    silent: bool,
    sync_failures: usize,
    block_rejections: usize,
    refuse_stub: bool,
    fail_control_lines: bool,
    link_broken: bool,

    // Observations
    open: bool,
    opens: usize,
    bytes_written: usize,
    commands: Vec<CommandType>,
    data_attempts: HashMap<u32, usize>,
    line_history: Vec<(bool, bool)>,
    app_started: bool,
}

impl SimState {
    fn new(chip: ChipFamily, flash_size: usize) -> Self {
        Self {
            chip,
            flash: vec![0xFF; flash_size],
            decoder: slip::SlipDecoder::new(),
            rx: VecDeque::new(),
            stub: false,
            transfer: Transfer::Idle,
            device_baud: crate::target::DEFAULT_BAUD,
            dtr: false,
            rts: false,
            registers: HashMap::new(),
            jedec_id: jedec_id(flash_size),
            silent: false,
            sync_failures: 0,
            block_rejections: 0,
            refuse_stub: false,
            fail_control_lines: false,
            link_broken: false,
            open: false,
            opens: 0,
            bytes_written: 0,
            commands: Vec::new(),
            data_attempts: HashMap::new(),
            line_history: Vec::new(),
            app_started: false,
        }
    }

    fn status_len(&self) -> usize {
        if self.stub { STUB_STATUS_LEN } else { ROM_STATUS_LEN }
    }

    fn reply(&mut self, op: CommandType, value: u32, data: &[u8]) {
        let raw = build_response(op as u8, value, data, 0, 0, self.status_len());
        self.rx
            .extend(slip::encode(&raw));
    }

    fn fail(&mut self, op: u8, kind: RomErrorKind) {
        let raw = build_response(op, 0, &[], 1, kind.code(), self.status_len());
        self.rx
            .extend(slip::encode(&raw));
    }

    fn checksum_error(&self) -> RomErrorKind {
        if self.stub {
            RomErrorKind::BadDataChecksum
        } else {
            RomErrorKind::InvalidCrc
        }
    }

    /// Chip comes out of reset: RAM is gone, the ROM is answering again.
    fn chip_reset(&mut self) {
        self.stub = false;
        self.transfer = Transfer::Idle;
        self.decoder.reset();
        self.device_baud = crate::target::DEFAULT_BAUD;
        self.app_started = !self.dtr;
    }

    fn set_lines(&mut self, dtr: bool, rts: bool) {
        let releasing_reset = self.rts && !rts;
        self.dtr = dtr;
        self.rts = rts;
        self.line_history.push((dtr, rts));
        if releasing_reset {
            self.chip_reset();
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.bytes_written += bytes.len();
        for frame in self.decoder.feed_all(bytes) {
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) {
        if raw.len() < 8 || raw[0] != 0x00 {
            trace!("sim: dropping malformed frame of {} bytes", raw.len());
            return;
        }
        let op = raw[1];
        let len = usize::from(u16::from_le_bytes([raw[2], raw[3]]));
        let declared_checksum = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let Some(payload) = raw.get(8..8 + len) else {
            self.fail(op, RomErrorKind::BadDataLen);
            return;
        };

        let Some(command) = CommandType::from_u8(op) else {
            self.fail(op, RomErrorKind::InvalidMessage);
            return;
        };
        self.commands.push(command);

        if self.silent {
            return;
        }

        match command {
            CommandType::Sync => self.on_sync(),
            CommandType::ReadReg => {
                let value = self.read_reg(word(payload, 0));
                self.reply(command, value, &[]);
            },
            CommandType::WriteReg => {
                self.write_reg(word(payload, 0), word(payload, 1));
                self.reply(command, 0, &[]);
            },
            CommandType::SpiAttach | CommandType::SpiSetParams => {
                self.reply(command, 0, &[]);
            },
            CommandType::ChangeBaudrate => {
                self.reply(command, 0, &[]);
                self.device_baud = word(payload, 0);
            },
            CommandType::MemBegin => {
                self.transfer = Transfer::Mem;
                self.reply(command, 0, &[]);
            },
            CommandType::MemData => {
                if checksum(&payload[16.min(payload.len())..]) != declared_checksum as u8 {
                    let kind = self.checksum_error();
                    self.fail(op, kind);
                } else {
                    self.reply(command, 0, &[]);
                }
            },
            CommandType::MemEnd => self.on_mem_end(payload),
            CommandType::FlashBegin | CommandType::FlashDeflBegin => {
                self.on_flash_begin(command, payload);
            },
            CommandType::FlashData | CommandType::FlashDeflData => {
                self.on_flash_data(command, payload, declared_checksum);
            },
            CommandType::FlashEnd | CommandType::FlashDeflEnd => {
                self.transfer = Transfer::Idle;
                self.reply(command, 0, &[]);
                if word(payload, 0) == 0 {
                    self.app_started = true;
                }
            },
            CommandType::FlashMd5 => self.on_md5(payload),
            CommandType::EraseFlash | CommandType::EraseRegion => {
                if !self.stub {
                    self.fail(op, RomErrorKind::InvalidMessage);
                    return;
                }
                let (start, end) = if command == CommandType::EraseFlash {
                    (0, self.flash.len())
                } else {
                    let start = word(payload, 0) as usize;
                    (start, start + word(payload, 1) as usize)
                };
                let end = end.min(self.flash.len());
                self.flash[start.min(end)..end].fill(0xFF);
                self.reply(command, 0, &[]);
            },
        }
    }

    fn read_reg(&self, address: u32) -> u32 {
        if address == CHIP_DETECT_MAGIC_REG_ADDR {
            return self.chip.magic();
        }
        let (low, high) = self.chip.mac_efuse_words();
        let base = self.chip.efuse_base();
        if address == base + low * 4 {
            return u32::from_be_bytes([SIM_MAC[2], SIM_MAC[3], SIM_MAC[4], SIM_MAC[5]]);
        }
        if address == base + high * 4 {
            return u32::from(u16::from_be_bytes([SIM_MAC[0], SIM_MAC[1]]));
        }
        self.registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    /// Store a register write. Starting an SPI user command runs it at once,
    /// so the command bit reads back clear.
    fn write_reg(&mut self, address: u32, value: u32) {
        let spi = self.chip.spi_registers();
        if address == spi.cmd() && value & SPI_CMD_USR != 0 {
            let opcode = self.read_reg(spi.usr2()) & 0xff;
            if opcode == u32::from(SPI_FLASH_RDID) {
                self.registers
                    .insert(spi.w0(), self.jedec_id);
            }
            self.registers
                .insert(address, value & !SPI_CMD_USR);
            return;
        }
        self.registers.insert(address, value);
    }

    fn on_sync(&mut self) {
        if self.sync_failures > 0 {
            self.sync_failures -= 1;
            return;
        }
        for _ in 0..SYNC_REPLIES {
            self.reply(CommandType::Sync, 0x2012_0707, &[]);
        }
    }

    fn on_mem_end(&mut self, payload: &[u8]) {
        self.transfer = Transfer::Idle;
        self.reply(CommandType::MemEnd, 0, &[]);
        let entry = word(payload, 1);
        if entry != 0 && !self.refuse_stub {
            self.stub = true;
            self.rx
                .extend(slip::encode(STUB_HANDSHAKE));
        }
    }

    fn on_flash_begin(&mut self, command: CommandType, payload: &[u8]) {
        // The original ESP32 ROM only understands the four-word form.
        if self.chip == ChipFamily::Esp32 && !self.stub && payload.len() > 16 {
            self.fail(command as u8, RomErrorKind::InvalidMessage);
            return;
        }

        let size = word(payload, 0) as usize;
        let block_size = word(payload, 2);
        let offset = word(payload, 3);
        let start = offset as usize;
        let sector = FLASH_SECTOR_SIZE as usize;
        let erase_end = (start + size.div_ceil(sector) * sector).min(self.flash.len());
        if start > self.flash.len() {
            self.fail(command as u8, RomErrorKind::FlashWriteError);
            return;
        }
        self.flash[start..erase_end].fill(0xFF);

        self.transfer = Transfer::Flash {
            offset,
            block_size,
            next_seq: 0,
            inflater: (command == CommandType::FlashDeflBegin).then(|| ZlibDecoder::new(Vec::new())),
            written: 0,
        };
        self.reply(command, 0, &[]);
    }

    fn on_flash_data(&mut self, command: CommandType, payload: &[u8], declared_checksum: u32) {
        let op = command as u8;
        let seq = word(payload, 1);
        *self
            .data_attempts
            .entry(seq)
            .or_insert(0) += 1;

        let data = &payload[16.min(payload.len())..];
        if self.block_rejections > 0 {
            self.block_rejections -= 1;
            let kind = self.checksum_error();
            self.fail(op, kind);
            return;
        }
        if u32::from(checksum(data)) != declared_checksum {
            let kind = self.checksum_error();
            self.fail(op, kind);
            return;
        }

        let flash_len = self.flash.len();
        match accept_block(&mut self.transfer, seq, data, flash_len) {
            Ok((start, bytes)) => {
                self.flash[start..start + bytes.len()].copy_from_slice(&bytes);
                self.reply(command, 0, &[]);
            },
            Err(kind) => self.fail(op, kind),
        }
    }

    fn on_md5(&mut self, payload: &[u8]) {
        let start = word(payload, 0) as usize;
        let end = (start + word(payload, 1) as usize).min(self.flash.len());
        let digest = Md5::digest(&self.flash[start.min(end)..end]);
        if self.stub {
            self.reply(CommandType::FlashMd5, 0, &digest);
        } else {
            let text = hex::encode(digest);
            self.reply(CommandType::FlashMd5, 0, text.as_bytes());
        }
    }
}

/// Advance an active flash transfer by one block. Returns where the decoded
/// bytes go.
fn accept_block(
    transfer: &mut Transfer,
    seq: u32,
    data: &[u8],
    flash_len: usize,
) -> std::result::Result<(usize, Vec<u8>), RomErrorKind> {
    let Transfer::Flash {
        offset,
        block_size,
        next_seq,
        inflater,
        written,
    } = transfer
    else {
        return Err(RomErrorKind::NotInFlashMode);
    };
    if seq != *next_seq {
        return Err(RomErrorKind::InvalidMessage);
    }

    let (position, bytes) = match inflater {
        Some(inflater) => {
            if inflater.write_all(data).is_err() || inflater.flush().is_err() {
                return Err(RomErrorKind::InflateError);
            }
            (*written, std::mem::take(inflater.get_mut()))
        },
        None => ((seq * *block_size) as usize, data.to_vec()),
    };

    let start = *offset as usize + position;
    if start + bytes.len() > flash_len {
        return Err(RomErrorKind::FlashWriteError);
    }
    *written = position + bytes.len();
    *next_seq += 1;
    Ok((start, bytes))
}

fn word(payload: &[u8], index: usize) -> u32 {
    payload
        .get(index * 4..index * 4 + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Shared control over a simulated device.
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// A simulated chip with [`DEFAULT_SIM_FLASH_SIZE`] bytes of flash.
    pub fn new(chip: ChipFamily) -> Self {
        Self::with_flash_size(chip, DEFAULT_SIM_FLASH_SIZE)
    }

    /// A simulated chip with `flash_size` bytes of flash.
    pub fn with_flash_size(chip: ChipFamily, flash_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(chip, flash_size))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens inside a failing test.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Open the simulated port. Fails while another handle holds it open.
    pub fn open(&self) -> Result<SimPort> {
        let mut state = self.lock();
        if state.open {
            return Err(Error::PortUnavailable {
                port: SimPort::NAME.to_string(),
                reason: "port is already open".to_string(),
            });
        }
        state.open = true;
        state.opens += 1;
        state.link_broken = false;
        state.rx.clear();
        Ok(SimPort {
            state: Arc::clone(&self.state),
            timeout: Duration::from_millis(1000),
            baud_rate: crate::target::DEFAULT_BAUD,
            closed: false,
        })
    }

    /// Never answer anything (board not in download mode).
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Ignore the next `count` SYNC commands.
    pub fn fail_syncs(&self, count: usize) {
        self.lock().sync_failures = count;
    }

    /// Answer the next `count` data blocks with a checksum error.
    pub fn reject_next_blocks(&self, count: usize) {
        self.lock().block_rejections = count;
    }

    /// Report `id` as the flash chip's JEDEC ID.
    pub fn set_jedec_id(&self, id: u32) {
        self.lock().jedec_id = id;
    }

    /// Last value written to register `address`.
    pub fn register(&self, address: u32) -> Option<u32> {
        self.lock()
            .registers
            .get(&address)
            .copied()
    }

    /// Accept the stub upload but never send the greeting.
    pub fn refuse_stub(&self, refuse: bool) {
        self.lock().refuse_stub = refuse;
    }

    /// Make DTR/RTS changes fail.
    pub fn fail_control_lines(&self, fail: bool) {
        self.lock().fail_control_lines = fail;
    }

    /// Make every further write fail, as if the cable was pulled.
    pub fn break_link(&self) {
        self.lock().link_broken = true;
    }

    /// Whether a port is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Number of times the port has been opened.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Total bytes written by the host.
    pub fn bytes_written(&self) -> usize {
        self.lock().bytes_written
    }

    /// Commands received, in order.
    pub fn commands(&self) -> Vec<CommandType> {
        self.lock()
            .commands
            .clone()
    }

    /// How often data block `sequence` was received.
    pub fn data_attempts(&self, sequence: u32) -> usize {
        self.lock()
            .data_attempts
            .get(&sequence)
            .copied()
            .unwrap_or(0)
    }

    /// Copy of `len` bytes of flash at `address`.
    pub fn flash(&self, address: usize, len: usize) -> Vec<u8> {
        let state = self.lock();
        let end = (address + len).min(state.flash.len());
        state.flash[address.min(end)..end].to_vec()
    }

    /// Whether the stub is running.
    pub fn is_stub(&self) -> bool {
        self.lock().stub
    }

    /// Baud rate the device is using.
    pub fn device_baud(&self) -> u32 {
        self.lock().device_baud
    }

    /// Every (DTR, RTS) state set by the host.
    pub fn line_history(&self) -> Vec<(bool, bool)> {
        self.lock()
            .line_history
            .clone()
    }

    /// Whether the device left the bootloader to run the application.
    pub fn app_started(&self) -> bool {
        self.lock().app_started
    }
}

/// A [`Port`] backed by the simulated bootloader.
pub struct SimPort {
    state: Arc<Mutex<SimState>>,
    timeout: Duration,
    baud_rate: u32,
    closed: bool,
}

impl SimPort {
    /// Name reported by [`Port::name`].
    pub const NAME: &'static str = "sim";

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lines(&mut self, dtr: Option<bool>, rts: Option<bool>) -> Result<()> {
        let mut state = self.lock();
        if state.fail_control_lines {
            return Err(Error::Io(io::Error::other("control line ioctl failed")));
        }
        let dtr = dtr.unwrap_or(state.dtr);
        let rts = rts.unwrap_or(state.rts);
        state.set_lines(dtr, rts);
        Ok(())
    }
}

impl Port for SimPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.lock()
            .rx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines(Some(level), None)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lines(None, Some(level))
    }

    fn set_control_lines(&mut self, dtr: bool, rts: bool) -> Result<()> {
        self.lines(Some(dtr), Some(rts))
    }

    fn read_cts(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn read_dsr(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut state = self.lock();
        state.open = false;
        state.rx.clear();
        Ok(())
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            if self.closed {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
            }
            let mut state = self.lock();
            let n = buf.len().min(state.rx.len());
            for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                *slot = byte;
            }
            n
        };

        if n == 0 {
            thread::sleep(self.timeout.min(Duration::from_millis(1)));
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        let mut state = self.lock();
        if state.link_broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        state.receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
