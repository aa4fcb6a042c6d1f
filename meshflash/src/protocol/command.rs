//! Request frame builder.

use byteorder::{LittleEndian, WriteBytesExt};

use super::{CommandType, slip};
use crate::error::{Error, Result};

/// Largest payload a request frame can declare.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Words in front of the block in a data command.
pub const DATA_HEADER_LEN: usize = 16;

/// Seed of the data checksum.
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Payload of the SYNC command: `07 07 12 20` followed by 32 x `0x55`.
pub const SYNC_PAYLOAD: [u8; 36] = {
    let mut payload = [0x55; 36];
    payload[0] = 0x07;
    payload[1] = 0x07;
    payload[2] = 0x12;
    payload[3] = 0x20;
    payload
};

/// XOR checksum over a data block, seeded with [`CHECKSUM_INIT`].
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(CHECKSUM_INIT, |acc, b| acc ^ b)
}

/// A loader request.
#[derive(Debug, Clone)]
pub struct Command {
    op: CommandType,
    checksum: u32,
    data: Vec<u8>,
}

impl Command {
    /// Create a command with an empty payload.
    pub fn new(op: CommandType) -> Self {
        Self {
            op,
            checksum: 0,
            data: Vec::new(),
        }
    }

    fn with_words(op: CommandType, words: &[u32]) -> Self {
        let mut cmd = Self::new(op);
        for &w in words {
            cmd.push_u32(w);
        }
        cmd
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn push_u32(&mut self, value: u32) {
        self.data
            .write_u32::<LittleEndian>(value)
            .unwrap();
    }

    /// SYNC.
    pub fn sync() -> Self {
        let mut cmd = Self::new(CommandType::Sync);
        cmd.data
            .extend_from_slice(&SYNC_PAYLOAD);
        cmd
    }

    /// READ_REG.
    pub fn read_reg(address: u32) -> Self {
        Self::with_words(CommandType::ReadReg, &[address])
    }

    /// WRITE_REG with a full mask and no delay.
    pub fn write_reg(address: u32, value: u32) -> Self {
        Self::with_words(CommandType::WriteReg, &[address, value, 0xFFFF_FFFF, 0])
    }

    /// SPI_ATTACH with default pins. The ROM expects an extra legacy word.
    pub fn spi_attach(stub: bool) -> Self {
        if stub {
            Self::with_words(CommandType::SpiAttach, &[0])
        } else {
            Self::with_words(CommandType::SpiAttach, &[0, 0])
        }
    }

    /// SPI_SET_PARAMS for a flash chip of `total_size` bytes.
    pub fn spi_set_params(total_size: u32) -> Self {
        Self::with_words(
            CommandType::SpiSetParams,
            &[0, total_size, 64 * 1024, 4 * 1024, 256, 0xFFFF],
        )
    }

    /// CHANGE_BAUDRATE. The ROM expects `prior` to be zero.
    pub fn change_baudrate(new: u32, prior: u32) -> Self {
        Self::with_words(CommandType::ChangeBaudrate, &[new, prior])
    }

    /// FLASH_BEGIN / FLASH_DEFL_BEGIN / MEM_BEGIN.
    ///
    /// `size` is the erase size (uncompressed). The trailing encryption word
    /// is only sent to chips that understand it.
    pub fn begin(
        op: CommandType,
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        encryption_word: bool,
    ) -> Self {
        let mut cmd = Self::with_words(op, &[size, blocks, block_size, offset]);
        if encryption_word {
            cmd.push_u32(0);
        }
        cmd
    }

    /// FLASH_DATA / FLASH_DEFL_DATA / MEM_DATA.
    ///
    /// The block is padded to `pad_to` bytes with `0xFF` and the checksum is
    /// computed over the padded data.
    #[allow(clippy::cast_possible_truncation)]
    pub fn data(op: CommandType, block: &[u8], sequence: u32, pad_to: usize) -> Self {
        let pad = pad_to.saturating_sub(block.len());
        let mut payload = Vec::with_capacity(block.len() + pad);
        payload.extend_from_slice(block);
        payload.resize(block.len() + pad, 0xFF);

        let mut cmd = Self::with_words(op, &[payload.len() as u32, sequence, 0, 0]);
        cmd.checksum = u32::from(checksum(&payload));
        cmd.data
            .extend_from_slice(&payload);
        cmd
    }

    /// FLASH_END / FLASH_DEFL_END. `reboot` asks the loader to run the app.
    pub fn end(op: CommandType, reboot: bool) -> Self {
        Self::with_words(op, &[u32::from(!reboot)])
    }

    /// MEM_END jumping to `entry`.
    pub fn mem_end(entry: u32) -> Self {
        Self::with_words(CommandType::MemEnd, &[u32::from(entry == 0), entry])
    }

    /// FLASH_MD5 over `size` bytes at `address`.
    pub fn flash_md5(address: u32, size: u32) -> Self {
        Self::with_words(CommandType::FlashMd5, &[address, size, 0, 0])
    }

    /// ERASE_FLASH (stub only).
    pub fn erase_flash() -> Self {
        Self::new(CommandType::EraseFlash)
    }

    /// Opcode of this request.
    pub fn command_type(&self) -> CommandType {
        self.op
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    /// Build the unframed packet.
    ///
    /// Fails when the payload does not fit the 16-bit length field.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Result<Vec<u8>> {
        let len = u16::try_from(self.data.len()).map_err(|_| {
            Error::Protocol(format!(
                "{} payload of {} bytes exceeds the {MAX_PAYLOAD_LEN} byte frame limit",
                self.op,
                self.data.len()
            ))
        })?;

        let mut buf = Vec::with_capacity(8 + self.data.len());
        buf.push(0x00);
        buf.push(self.op as u8);
        buf.write_u16::<LittleEndian>(len)
            .unwrap();
        buf.write_u32::<LittleEndian>(self.checksum)
            .unwrap();
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Build the SLIP-framed packet ready for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(slip::encode(&self.build()?))
    }
}
