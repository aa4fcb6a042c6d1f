//! Chip-specific implementations.
//!
//! Only the ESP32 family is supported. [`chip`] holds the family table and
//! loader tuning; [`esp32`] holds the bootloader driver, reset sequences and
//! the flasher stub.

pub mod chip;
pub mod esp32;

pub use chip::{
    CHIP_DETECT_MAGIC_REG_ADDR, ChipFamily, DEFAULT_BAUD, FLASH_SECTOR_SIZE, LoaderConfig,
    MAX_FLASH_WRITE_SIZE, ROM_FLASH_WRITE_SIZE, SPI_CMD_USR, SPI_FLASH_RDID, STUB_FLASH_WRITE_SIZE,
    SpiRegisters, flash_size_from_capacity,
};
pub use esp32::{EspLoader, FlashStub, ResetStrategy};
