//! Response frame parser.

use super::{CommandType, RomErrorKind};
use crate::error::{Error, Result};

/// Direction byte of a response.
pub const RESPONSE_DIRECTION: u8 = 0x01;

/// Number of status bytes the ROM loader appends.
pub const ROM_STATUS_LEN: usize = 4;

/// Number of status bytes the stub appends.
pub const STUB_STATUS_LEN: usize = 2;

/// A decoded loader response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Opcode this response answers.
    pub op: u8,
    /// 32-bit value field (register value for READ_REG).
    pub value: u32,
    /// Payload between the value field and the status bytes.
    pub data: Vec<u8>,
    /// Non-zero on failure.
    pub status: u8,
    /// Error code when `status` is non-zero.
    pub error: u8,
}

impl Response {
    /// Parse an unframed response packet.
    ///
    /// `status_len` is [`ROM_STATUS_LEN`] or [`STUB_STATUS_LEN`] depending on
    /// who is answering.
    pub fn parse(raw: &[u8], status_len: usize) -> Result<Self> {
        if raw.len() < 8 + status_len {
            return Err(Error::Protocol(format!(
                "response too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] != RESPONSE_DIRECTION {
            return Err(Error::Protocol(format!(
                "unexpected direction byte 0x{:02X}",
                raw[0]
            )));
        }

        let len = usize::from(u16::from_le_bytes([raw[2], raw[3]]));
        let body = &raw[8..];
        if body.len() < len || len < status_len {
            return Err(Error::Protocol(format!(
                "response length field {len} does not match {} body bytes",
                body.len()
            )));
        }
        let body = &body[..len];
        let (data, status) = body.split_at(len - status_len);

        Ok(Self {
            op: raw[1],
            value: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            data: data.to_vec(),
            status: status[0],
            error: status[1],
        })
    }

    /// Whether this response answers `op`.
    pub fn answers(&self, op: CommandType) -> bool {
        self.op == op as u8
    }

    /// Turn a failure status into an error for `command`.
    pub fn check(self, command: CommandType) -> Result<Self> {
        if self.status != 0 {
            return Err(Error::Rom {
                command,
                kind: RomErrorKind::from(self.error),
            });
        }
        Ok(self)
    }

    /// The MD5 digest carried by a FLASH_MD5 response.
    ///
    /// The ROM sends 32 ASCII hex characters, the stub 16 raw bytes.
    pub fn md5(&self) -> Result<[u8; 16]> {
        let mut digest = [0u8; 16];
        match self.data.len() {
            16 => digest.copy_from_slice(&self.data),
            32 => hex::decode_to_slice(&self.data, &mut digest)
                .map_err(|e| Error::Protocol(format!("bad MD5 text in response: {e}")))?,
            n => {
                return Err(Error::Protocol(format!(
                    "unexpected MD5 response payload of {n} bytes"
                )));
            },
        }
        Ok(digest)
    }
}

/// Build an unframed response packet. Used by the simulated loader.
#[allow(clippy::cast_possible_truncation)]
pub fn build_response(op: u8, value: u32, data: &[u8], status: u8, error: u8, status_len: usize) -> Vec<u8> {
    let len = data.len() + status_len;
    let mut raw = Vec::with_capacity(8 + len);
    raw.push(RESPONSE_DIRECTION);
    raw.push(op);
    raw.extend_from_slice(&(len as u16).to_le_bytes());
    raw.extend_from_slice(&value.to_le_bytes());
    raw.extend_from_slice(data);
    raw.push(status);
    raw.push(error);
    raw.resize(8 + len, 0);
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rom_response() {
        let raw = build_response(0x0A, 0x00f0_1d83, &[], 0, 0, ROM_STATUS_LEN);
        assert_eq!(raw.len(), 12);

        let resp = Response::parse(&raw, ROM_STATUS_LEN).unwrap();
        assert!(resp.answers(CommandType::ReadReg));
        assert_eq!(resp.value, 0x00f0_1d83);
        assert!(resp.data.is_empty());
    }

    #[test]
    fn test_parse_failure_status() {
        let raw = build_response(0x03, 0, &[], 1, 0xC1, STUB_STATUS_LEN);
        let err = Response::parse(&raw, STUB_STATUS_LEN)
            .unwrap()
            .check(CommandType::FlashData)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Rom {
                kind: RomErrorKind::BadDataChecksum,
                ..
            }
        ));
    }

    #[test]
    fn test_md5_rom_and_stub_forms() {
        let digest: [u8; 16] = core::array::from_fn(|i| i as u8);

        let ascii = hex::encode(digest);
        let rom = build_response(0x13, 0, ascii.as_bytes(), 0, 0, ROM_STATUS_LEN);
        assert_eq!(rom.len(), 44);
        assert_eq!(Response::parse(&rom, ROM_STATUS_LEN).unwrap().md5().unwrap(), digest);

        let stub = build_response(0x13, 0, &digest, 0, 0, STUB_STATUS_LEN);
        assert_eq!(stub.len(), 26);
        assert_eq!(Response::parse(&stub, STUB_STATUS_LEN).unwrap().md5().unwrap(), digest);
    }

    #[test]
    fn test_rejects_short_and_wrong_direction() {
        assert!(Response::parse(&[0x01, 0x08], ROM_STATUS_LEN).is_err());
        let mut raw = build_response(0x08, 0, &[], 0, 0, ROM_STATUS_LEN);
        raw[0] = 0x00;
        assert!(Response::parse(&raw, ROM_STATUS_LEN).is_err());
    }
}
