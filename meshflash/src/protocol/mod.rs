//! ESP ROM / stub loader serial protocol.
//!
//! ## Frame Format
//!
//! Requests and responses are SLIP-framed packets:
//!
//! ```text
//! request:  | 0x00 | op | len: u16 | checksum: u32 | data ...              |
//! response: | 0x01 | op | len: u16 | value: u32    | data ... | status ... |
//! ```
//!
//! The ROM loader appends four status bytes, the stub two. Only the data
//! commands (`FLASH_DATA`, `FLASH_DEFL_DATA`, `MEM_DATA`) carry a checksum.

pub mod command;
pub mod response;
pub mod slip;

use std::fmt;
use std::time::Duration;

pub use command::{Command, checksum};
pub use response::Response;

/// Default timeout for a command response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Per-megabyte allowance for commands that erase before writing.
pub const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
/// Per-megabyte allowance for data blocks (erase + write).
pub const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
/// Full-chip erase.
pub const ERASE_CHIP_TIMEOUT: Duration = Duration::from_secs(120);
/// `MEM_END` jumps into the stub, so the answer comes quickly or never.
pub const MEM_END_TIMEOUT: Duration = Duration::from_millis(50);
/// One sync attempt.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(100);
/// Flushing the last deflate block.
pub const FLASH_DEFLATE_END_TIMEOUT: Duration = Duration::from_secs(10);
/// Hashing a region on the device.
pub const FLASH_MD5_TIMEOUT: Duration = Duration::from_secs(8);
/// Allowance per megabyte hashed by `FLASH_MD5`.
pub const FLASH_MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);

/// Loader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandType {
    /// Begin a flash write (erases the target region).
    FlashBegin = 0x02,
    /// One block of flash data.
    FlashData = 0x03,
    /// Finish a flash write.
    FlashEnd = 0x04,
    /// Begin a RAM write.
    MemBegin = 0x05,
    /// Finish a RAM write and optionally jump to an entry point.
    MemEnd = 0x06,
    /// One block of RAM data.
    MemData = 0x07,
    /// Synchronize baud rate and framing.
    Sync = 0x08,
    /// Write a 32-bit register.
    WriteReg = 0x09,
    /// Read a 32-bit register.
    ReadReg = 0x0A,
    /// Configure SPI flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash.
    SpiAttach = 0x0D,
    /// Change the UART baud rate.
    ChangeBaudrate = 0x0F,
    /// Begin a compressed flash write.
    FlashDeflBegin = 0x10,
    /// One block of compressed flash data.
    FlashDeflData = 0x11,
    /// Finish a compressed flash write.
    FlashDeflEnd = 0x12,
    /// MD5 of a flash region.
    FlashMd5 = 0x13,
    /// Erase the whole flash (stub only).
    EraseFlash = 0xD0,
    /// Erase a region (stub only).
    EraseRegion = 0xD1,
}

impl CommandType {
    /// Look up an opcode.
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0x02 => Self::FlashBegin,
            0x03 => Self::FlashData,
            0x04 => Self::FlashEnd,
            0x05 => Self::MemBegin,
            0x06 => Self::MemEnd,
            0x07 => Self::MemData,
            0x08 => Self::Sync,
            0x09 => Self::WriteReg,
            0x0A => Self::ReadReg,
            0x0B => Self::SpiSetParams,
            0x0D => Self::SpiAttach,
            0x0F => Self::ChangeBaudrate,
            0x10 => Self::FlashDeflBegin,
            0x11 => Self::FlashDeflData,
            0x12 => Self::FlashDeflEnd,
            0x13 => Self::FlashMd5,
            0xD0 => Self::EraseFlash,
            0xD1 => Self::EraseRegion,
            _ => return None,
        })
    }

    /// Response timeout for this command.
    pub fn timeout(self) -> Duration {
        match self {
            Self::MemEnd => MEM_END_TIMEOUT,
            Self::Sync => SYNC_TIMEOUT,
            Self::EraseFlash => ERASE_CHIP_TIMEOUT,
            Self::FlashDeflEnd => FLASH_DEFLATE_END_TIMEOUT,
            Self::FlashMd5 => FLASH_MD5_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Response timeout for a command touching `size` bytes of flash.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn timeout_for_size(self, size: u32) -> Duration {
        let scaled = |per_mb: Duration| {
            let mb = f64::from(size) / 1_000_000.0;
            let millis = (per_mb.as_millis() as f64 * mb) as u64;
            Duration::from_millis(millis).max(self.timeout())
        };

        match self {
            Self::FlashBegin | Self::FlashDeflBegin | Self::EraseRegion => {
                scaled(ERASE_REGION_TIMEOUT_PER_MB)
            },
            Self::FlashData | Self::FlashDeflData => scaled(ERASE_WRITE_TIMEOUT_PER_MB),
            Self::FlashMd5 => scaled(FLASH_MD5_TIMEOUT_PER_MB),
            _ => self.timeout(),
        }
    }

    /// Whether the request carries a data checksum.
    pub fn is_data(self) -> bool {
        matches!(self, Self::FlashData | Self::FlashDeflData | Self::MemData)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FlashBegin => "FLASH_BEGIN",
            Self::FlashData => "FLASH_DATA",
            Self::FlashEnd => "FLASH_END",
            Self::MemBegin => "MEM_BEGIN",
            Self::MemEnd => "MEM_END",
            Self::MemData => "MEM_DATA",
            Self::Sync => "SYNC",
            Self::WriteReg => "WRITE_REG",
            Self::ReadReg => "READ_REG",
            Self::SpiSetParams => "SPI_SET_PARAMS",
            Self::SpiAttach => "SPI_ATTACH",
            Self::ChangeBaudrate => "CHANGE_BAUDRATE",
            Self::FlashDeflBegin => "FLASH_DEFL_BEGIN",
            Self::FlashDeflData => "FLASH_DEFL_DATA",
            Self::FlashDeflEnd => "FLASH_DEFL_END",
            Self::FlashMd5 => "FLASH_MD5",
            Self::EraseFlash => "ERASE_FLASH",
            Self::EraseRegion => "ERASE_REGION",
        };
        f.write_str(name)
    }
}

/// Error codes reported in the response status bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomErrorKind {
    /// Invalid message received.
    InvalidMessage,
    /// Bootloader failed to execute command.
    FailedToAct,
    /// Received message has invalid CRC.
    InvalidCrc,
    /// Bootloader failed to write to flash.
    FlashWriteError,
    /// Bootloader failed to read from flash.
    FlashReadError,
    /// Invalid length for flash read.
    FlashReadLengthError,
    /// Malformed compressed data received.
    DeflateError,
    /// Bad data length (stub).
    BadDataLen,
    /// Bad data checksum (stub).
    BadDataChecksum,
    /// Bad block size (stub).
    BadBlocksize,
    /// Invalid command (stub).
    InvalidCommand,
    /// SPI operation failed (stub).
    FailedSpiOp,
    /// SPI unlock failed (stub).
    FailedSpiUnlock,
    /// Not in flash mode (stub).
    NotInFlashMode,
    /// Error when uncompressing the data (stub).
    InflateError,
    /// Didn't receive enough data (stub).
    NotEnoughData,
    /// Received too much data (stub).
    TooMuchData,
    /// Any other code.
    Other(u8),
}

impl RomErrorKind {
    /// Raw status code.
    pub fn code(self) -> u8 {
        match self {
            Self::InvalidMessage => 0x05,
            Self::FailedToAct => 0x06,
            Self::InvalidCrc => 0x07,
            Self::FlashWriteError => 0x08,
            Self::FlashReadError => 0x09,
            Self::FlashReadLengthError => 0x0A,
            Self::DeflateError => 0x0B,
            Self::BadDataLen => 0xC0,
            Self::BadDataChecksum => 0xC1,
            Self::BadBlocksize => 0xC2,
            Self::InvalidCommand => 0xC3,
            Self::FailedSpiOp => 0xC4,
            Self::FailedSpiUnlock => 0xC5,
            Self::NotInFlashMode => 0xC6,
            Self::InflateError => 0xC7,
            Self::NotEnoughData => 0xC8,
            Self::TooMuchData => 0xC9,
            Self::Other(code) => code,
        }
    }

    /// A block was corrupted or arrived out of order; resending it may help.
    pub fn is_block_rejection(self) -> bool {
        matches!(
            self,
            Self::InvalidCrc | Self::BadDataChecksum | Self::BadDataLen | Self::InvalidMessage
        )
    }
}

impl From<u8> for RomErrorKind {
    fn from(code: u8) -> Self {
        match code {
            0x05 => Self::InvalidMessage,
            0x06 => Self::FailedToAct,
            0x07 => Self::InvalidCrc,
            0x08 => Self::FlashWriteError,
            0x09 => Self::FlashReadError,
            0x0A => Self::FlashReadLengthError,
            0x0B => Self::DeflateError,
            0xC0 => Self::BadDataLen,
            0xC1 => Self::BadDataChecksum,
            0xC2 => Self::BadBlocksize,
            0xC3 => Self::InvalidCommand,
            0xC4 => Self::FailedSpiOp,
            0xC5 => Self::FailedSpiUnlock,
            0xC6 => Self::NotInFlashMode,
            0xC7 => Self::InflateError,
            0xC8 => Self::NotEnoughData,
            0xC9 => Self::TooMuchData,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for RomErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMessage => write!(f, "invalid message received"),
            Self::FailedToAct => write!(f, "bootloader failed to execute command"),
            Self::InvalidCrc => write!(f, "received message has invalid checksum"),
            Self::FlashWriteError => write!(f, "bootloader failed to write to flash"),
            Self::FlashReadError => write!(f, "bootloader failed to read from flash"),
            Self::FlashReadLengthError => write!(f, "invalid length for flash read"),
            Self::DeflateError => write!(f, "malformed compressed data received"),
            Self::BadDataLen => write!(f, "bad data length"),
            Self::BadDataChecksum => write!(f, "bad data checksum"),
            Self::BadBlocksize => write!(f, "bad block size"),
            Self::InvalidCommand => write!(f, "invalid command"),
            Self::FailedSpiOp => write!(f, "SPI operation failed"),
            Self::FailedSpiUnlock => write!(f, "SPI unlock failed"),
            Self::NotInFlashMode => write!(f, "not in flash mode"),
            Self::InflateError => write!(f, "error when uncompressing the data"),
            Self::NotEnoughData => write!(f, "didn't receive enough data"),
            Self::TooMuchData => write!(f, "received too much data"),
            Self::Other(code) => write!(f, "error code 0x{code:02X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_round_trip() {
        for op in 0..=u8::MAX {
            if let Some(ty) = CommandType::from_u8(op) {
                assert_eq!(ty as u8, op);
            }
        }
    }

    #[test]
    fn test_timeouts_per_class() {
        assert_eq!(CommandType::Sync.timeout(), SYNC_TIMEOUT);
        assert_eq!(CommandType::EraseFlash.timeout(), ERASE_CHIP_TIMEOUT);
        assert_eq!(CommandType::ReadReg.timeout(), DEFAULT_TIMEOUT);
        assert!(CommandType::EraseFlash.timeout() > CommandType::FlashData.timeout() * 10);
    }

    #[test]
    fn test_timeout_for_size_scales_with_size() {
        let small = CommandType::FlashBegin.timeout_for_size(0x1000);
        let large = CommandType::FlashBegin.timeout_for_size(16 * 1024 * 1024);
        assert_eq!(small, DEFAULT_TIMEOUT);
        assert!(large > Duration::from_secs(400));
    }

    #[test]
    fn test_rom_error_codes() {
        assert_eq!(RomErrorKind::from(0x07), RomErrorKind::InvalidCrc);
        assert_eq!(RomErrorKind::from(0xC1), RomErrorKind::BadDataChecksum);
        assert_eq!(RomErrorKind::from(0x42), RomErrorKind::Other(0x42));
        assert_eq!(RomErrorKind::from(0xC9).code(), 0xC9);
    }
}
