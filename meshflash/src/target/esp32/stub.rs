//! Flasher stub images.
//!
//! A stub is a small program loaded into the chip's RAM that speaks the same
//! protocol as the ROM loader but accepts larger blocks and adds chip erase.
//! Stubs are distributed as TOML:
//!
//! ```toml
//! entry = 1077413304
//! text = "<base64>"
//! text_start = 1077411840
//! data = "<base64>"
//! data_start = 1070164916
//! ```

#[cfg(feature = "serde")]
use crate::error::{Error, Result};

/// Largest RAM block the ROM accepts in one MEM_DATA.
pub const MEM_WRITE_SIZE: u32 = 0x1800;

/// Greeting the stub sends once it is running.
pub const STUB_HANDSHAKE: &[u8] = b"OHAI";

/// A RAM-loadable stub program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashStub {
    entry: u32,
    text_start: u32,
    text: Vec<u8>,
    data_start: u32,
    data: Vec<u8>,
}

impl FlashStub {
    /// Build a stub from already decoded segments.
    pub fn new(entry: u32, text_start: u32, text: Vec<u8>, data_start: u32, data: Vec<u8>) -> Self {
        Self {
            entry,
            text_start,
            text,
            data_start,
            data,
        }
    }

    /// Entry point address.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Segments to write, as `(address, bytes)`. Empty segments are skipped.
    pub fn segments(&self) -> impl Iterator<Item = (u32, &[u8])> {
        [
            (self.text_start, self.text.as_slice()),
            (self.data_start, self.data.as_slice()),
        ]
        .into_iter()
        .filter(|(_, bytes)| !bytes.is_empty())
    }

    /// Parse a stub from its TOML description.
    #[cfg(feature = "serde")]
    pub fn from_toml(source: &str) -> Result<Self> {
        use base64::{Engine as _, engine::general_purpose};

        #[derive(serde::Deserialize)]
        struct RawStub {
            entry: u32,
            text: String,
            text_start: u32,
            #[serde(default)]
            data: String,
            #[serde(default)]
            data_start: u32,
        }

        let raw: RawStub =
            toml::from_str(source).map_err(|e| Error::Config(format!("invalid stub TOML: {e}")))?;
        let decode = |field: &str, value: &str| {
            general_purpose::STANDARD
                .decode(value)
                .map_err(|e| Error::Config(format!("stub {field} is not valid base64: {e}")))
        };

        Ok(Self::new(
            raw.entry,
            raw.text_start,
            decode("text", &raw.text)?,
            raw.data_start,
            decode("data", &raw.data)?,
        ))
    }

    /// Load a stub TOML file.
    #[cfg(feature = "serde")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source)
    }
}
