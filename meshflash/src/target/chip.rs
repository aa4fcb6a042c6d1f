//! ESP32 chip families and loader configuration.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::command::{DATA_HEADER_LEN, MAX_PAYLOAD_LEN};

/// Register read during connect to tell the chip families apart.
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Flash sector size; flash writes start on a sector boundary.
pub const FLASH_SECTOR_SIZE: u32 = 0x1000;

/// Block size understood by the ROM loader.
///
/// Deliberately below the 4 KiB to 16 KiB range used with the stub: the ROM
/// buffers a single 1 KiB block, so ROM transfers move in smaller steps.
pub const ROM_FLASH_WRITE_SIZE: u32 = 0x400;

/// Block size used once the stub is running.
pub const STUB_FLASH_WRITE_SIZE: u32 = 0x4000;

/// Largest data block a request frame can carry: the 16-bit length field
/// also covers the 16-byte data header.
#[allow(clippy::cast_possible_truncation)]
pub const MAX_FLASH_WRITE_SIZE: u32 = (MAX_PAYLOAD_LEN - DATA_HEADER_LEN) as u32;

/// Baud rate the ROM loader starts with.
pub const DEFAULT_BAUD: u32 = 115_200;

const MAGIC_VALUES: &[(ChipFamily, &[u32])] = &[
    (ChipFamily::Esp32, &[0x00f0_1d83]),
    (ChipFamily::Esp32S2, &[0x0000_07c6]),
    (ChipFamily::Esp32S3, &[0x9]),
    (
        ChipFamily::Esp32C3,
        &[0x6921_506f, 0x1b31_506f, 0x4881_606f, 0x4361_606f],
    ),
    (ChipFamily::Esp32C2, &[0x6f51_306f, 0x7c41_a06f]),
    (ChipFamily::Esp32C6, &[0x2ce0_806f]),
    (ChipFamily::Esp32H2, &[0xd7b7_3e80]),
];

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChipFamily {
    /// ESP32 (Xtensa LX6).
    Esp32,
    /// ESP32-S2 (Xtensa LX7, single core).
    Esp32S2,
    /// ESP32-S3 (Xtensa LX7, dual core).
    Esp32S3,
    /// ESP32-C2 (RISC-V).
    Esp32C2,
    /// ESP32-C3 (RISC-V).
    Esp32C3,
    /// ESP32-C6 (RISC-V).
    Esp32C6,
    /// ESP32-H2 (RISC-V).
    Esp32H2,
}

impl ChipFamily {
    /// All families, in detection order.
    pub const ALL: [Self; 7] = [
        Self::Esp32,
        Self::Esp32S2,
        Self::Esp32S3,
        Self::Esp32C2,
        Self::Esp32C3,
        Self::Esp32C6,
        Self::Esp32H2,
    ];

    /// Classify a chip from the value at [`CHIP_DETECT_MAGIC_REG_ADDR`].
    #[must_use]
    pub fn from_magic(magic: u32) -> Option<Self> {
        MAGIC_VALUES
            .iter()
            .find(|(_, values)| values.contains(&magic))
            .map(|(chip, _)| *chip)
    }

    /// One magic value of this family.
    #[must_use]
    pub fn magic(&self) -> u32 {
        MAGIC_VALUES
            .iter()
            .find(|(chip, _)| chip == self)
            .map_or(0, |(_, values)| values[0])
    }

    /// Get the chip family from a string name (`esp32s3`, `ESP32-S3`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "esp32" => Some(Self::Esp32),
            "esp32s2" => Some(Self::Esp32S2),
            "esp32s3" => Some(Self::Esp32S3),
            "esp32c2" => Some(Self::Esp32C2),
            "esp32c3" => Some(Self::Esp32C3),
            "esp32c6" => Some(Self::Esp32C6),
            "esp32h2" => Some(Self::Esp32H2),
            _ => None,
        }
    }

    /// Short identifier as used in file names (`esp32s3`).
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Esp32 => "esp32",
            Self::Esp32S2 => "esp32s2",
            Self::Esp32S3 => "esp32s3",
            Self::Esp32C2 => "esp32c2",
            Self::Esp32C3 => "esp32c3",
            Self::Esp32C6 => "esp32c6",
            Self::Esp32H2 => "esp32h2",
        }
    }

    /// Whether the ROM accepts the encryption word in FLASH_BEGIN.
    ///
    /// The original ESP32 ROM rejects the longer frame.
    #[must_use]
    pub fn supports_encryption(&self) -> bool {
        !matches!(self, Self::Esp32)
    }

    /// SPI flash controller registers used for raw flash commands.
    #[must_use]
    pub fn spi_registers(&self) -> SpiRegisters {
        match self {
            Self::Esp32 => SpiRegisters {
                base: 0x3ff4_2000,
                usr_offset: 0x1c,
                usr2_offset: 0x24,
                w0_offset: 0x80,
                mosi_length_offset: 0x28,
                miso_length_offset: 0x2c,
            },
            Self::Esp32S2 => SpiRegisters::standard(0x3f40_2000),
            Self::Esp32S3 | Self::Esp32C2 | Self::Esp32C3 => SpiRegisters::standard(0x6000_2000),
            Self::Esp32C6 | Self::Esp32H2 => SpiRegisters::standard(0x6000_3000),
        }
    }

    /// Base address of the eFuse register block.
    #[must_use]
    pub fn efuse_base(&self) -> u32 {
        match self {
            Self::Esp32 => 0x3ff5_a000,
            Self::Esp32S2 => 0x3f41_a000,
            Self::Esp32S3 => 0x6000_7000,
            Self::Esp32C2 | Self::Esp32C3 => 0x6000_8800,
            Self::Esp32C6 | Self::Esp32H2 => 0x600b_0800,
        }
    }

    /// eFuse words holding the factory MAC, low word first.
    #[must_use]
    pub fn mac_efuse_words(&self) -> (u32, u32) {
        match self {
            Self::Esp32 => (1, 2),
            Self::Esp32C2 => (16, 17),
            _ => (17, 18),
        }
    }
}

/// SPI flash controller register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: u32,
    miso_length_offset: u32,
}

impl SpiRegisters {
    const fn standard(base: u32) -> Self {
        Self {
            base,
            usr_offset: 0x18,
            usr2_offset: 0x20,
            w0_offset: 0x58,
            mosi_length_offset: 0x24,
            miso_length_offset: 0x28,
        }
    }

    /// Command register; writing [`SPI_CMD_USR`] starts a user command.
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    /// First data buffer word.
    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> u32 {
        self.base + self.mosi_length_offset
    }

    pub fn miso_length(&self) -> u32 {
        self.base + self.miso_length_offset
    }
}

/// Bit in the SPI command register that runs a user command; it reads back
/// set until the command completes.
pub const SPI_CMD_USR: u32 = 1 << 18;

/// JEDEC "read identification" flash opcode.
pub const SPI_FLASH_RDID: u8 = 0x9f;

/// Flash size in bytes for the capacity byte of a JEDEC ID.
///
/// Vendors disagree on the encoding above 32 MiB, so a few aliases map to
/// the same size. Returns `None` for blank (`0xff`) or unknown ids.
#[must_use]
pub fn flash_size_from_capacity(capacity: u8) -> Option<u32> {
    let exponent = match capacity {
        0x12..=0x19 => u32::from(capacity),
        0x32..=0x39 => u32::from(capacity) - 0x20,
        0x1a | 0x3a | 0x20 => 0x1a,
        0x1b | 0x21 => 0x1b,
        0x1c | 0x22 => 0x1c,
        _ => return None,
    };
    Some(1 << exponent)
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esp32 => write!(f, "ESP32"),
            Self::Esp32S2 => write!(f, "ESP32-S2"),
            Self::Esp32S3 => write!(f, "ESP32-S3"),
            Self::Esp32C2 => write!(f, "ESP32-C2"),
            Self::Esp32C3 => write!(f, "ESP32-C3"),
            Self::Esp32C6 => write!(f, "ESP32-C6"),
            Self::Esp32H2 => write!(f, "ESP32-H2"),
        }
    }
}

/// Loader tuning parameters.
///
/// Defaults follow the ROM/stub limits; block sizes and retry bounds can be
/// adjusted for flaky links.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Data block size while talking to the ROM.
    pub rom_block_size: u32,
    /// Data block size while talking to the stub.
    pub stub_block_size: u32,
    /// Attempts per data block before the transfer is aborted.
    pub max_block_attempts: usize,
    /// Reset+sync rounds before giving up with `NoResponse`.
    pub connect_attempts: usize,
    /// SYNC frames sent per connect round.
    pub sync_attempts: usize,
    /// Time the reset pulse holds the chip in reset.
    pub reset_delay: Duration,
    /// Time BOOT stays asserted after reset is released. Alternate connect
    /// rounds use a slow variant eleven times longer for boards with large
    /// capacitors on EN.
    pub boot_delay: Duration,
    /// Send deflate-compressed blocks.
    pub compress: bool,
    /// Compare the device's MD5 of each written region with the image.
    pub verify: bool,
    /// Baud rate to switch to after connecting; `None` keeps the initial one.
    pub target_baud: Option<u32>,
    /// Flash size in bytes, if known (enables SPI_SET_PARAMS and ROM erase).
    pub flash_size: Option<u32>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            rom_block_size: ROM_FLASH_WRITE_SIZE,
            stub_block_size: STUB_FLASH_WRITE_SIZE,
            max_block_attempts: 3,
            connect_attempts: 7,
            sync_attempts: 5,
            reset_delay: Duration::from_millis(100),
            boot_delay: Duration::from_millis(50),
            compress: true,
            verify: true,
            target_baud: None,
            flash_size: None,
        }
    }
}

impl LoaderConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ROM block size, clamped to `1..=MAX_FLASH_WRITE_SIZE`.
    #[must_use]
    pub fn with_rom_block_size(mut self, size: u32) -> Self {
        self.rom_block_size = size.clamp(1, MAX_FLASH_WRITE_SIZE);
        self
    }

    /// Set the stub block size, clamped to `1..=MAX_FLASH_WRITE_SIZE`.
    #[must_use]
    pub fn with_stub_block_size(mut self, size: u32) -> Self {
        self.stub_block_size = size.clamp(1, MAX_FLASH_WRITE_SIZE);
        self
    }

    /// Check the block sizes, which may have been set on the fields directly.
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("ROM block size", self.rom_block_size),
            ("stub block size", self.stub_block_size),
        ] {
            if !(1..=MAX_FLASH_WRITE_SIZE).contains(&size) {
                return Err(Error::Config(format!(
                    "{name} {size} is outside 1..={MAX_FLASH_WRITE_SIZE}"
                )));
            }
        }
        Ok(())
    }

    /// Set the per-block attempt bound (at least one).
    #[must_use]
    pub fn with_max_block_attempts(mut self, attempts: usize) -> Self {
        self.max_block_attempts = attempts.max(1);
        self
    }

    /// Set the number of reset+sync rounds.
    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: usize) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Set the number of SYNC frames per round.
    #[must_use]
    pub fn with_sync_attempts(mut self, attempts: usize) -> Self {
        self.sync_attempts = attempts.max(1);
        self
    }

    /// Set the reset pulse width.
    #[must_use]
    pub fn with_reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Set how long BOOT is held after reset.
    #[must_use]
    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    /// Enable or disable compressed transfers.
    #[must_use]
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Enable or disable post-write MD5 verification.
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Switch to `baud` after connecting.
    #[must_use]
    pub fn with_target_baud(mut self, baud: Option<u32>) -> Self {
        self.target_baud = baud;
        self
    }

    /// Declare the flash size.
    #[must_use]
    pub fn with_flash_size(mut self, size: Option<u32>) -> Self {
        self.flash_size = size;
        self
    }
}
