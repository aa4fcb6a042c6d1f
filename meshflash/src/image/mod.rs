//! Firmware images and where they come from.
//!
//! Release images are pre-merged (bootloader, partition table and
//! application) and always land at [`MERGED_IMAGE_ADDRESS`](crate::catalog::MERGED_IMAGE_ADDRESS).
//! They are either served by an [`ImageSource`] together with a detached
//! `.sha256` file, or loaded from a user-supplied path.

pub mod checksum;
pub mod naming;
pub mod source;

pub use checksum::{ChecksumFile, sha256_hex, verify};
pub use naming::{FirmwareName, ProtocolVariant};
pub use source::{DirectorySource, ImageSource, load_catalog_image, load_file};

/// Outcome of the checksum step for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Verification {
    /// The image matched its published SHA-256.
    Verified,
    /// No checksum was published; the image was accepted as is.
    Unverified,
    /// User-supplied file; nothing to verify against.
    NotApplicable,
}

/// Where an image came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// File name of the image.
    pub filename: String,
    /// Checksum outcome.
    pub verification: Verification,
}

/// A firmware image ready to be flashed.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// Image bytes.
    pub data: Vec<u8>,
    /// Flash address the image is written to.
    pub address: u32,
    /// Origin of the image, if known.
    pub provenance: Option<Provenance>,
}

impl FirmwareImage {
    /// Create an image without provenance.
    pub fn new(data: Vec<u8>, address: u32) -> Self {
        Self {
            data,
            address,
            provenance: None,
        }
    }

    /// Image size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the image matched a published checksum.
    pub fn is_verified(&self) -> bool {
        self.provenance
            .as_ref()
            .is_some_and(|p| p.verification == Verification::Verified)
    }

    /// Borrow the image as a file to flash.
    pub fn as_flash_file(&self) -> FlashFile<'_> {
        FlashFile {
            address: self.address,
            data: &self.data,
        }
    }
}

/// One `(address, bytes)` region handed to the flash session.
#[derive(Debug, Clone, Copy)]
pub struct FlashFile<'a> {
    /// Start address in flash.
    pub address: u32,
    /// Bytes to write.
    pub data: &'a [u8],
}

impl<'a> FlashFile<'a> {
    /// Create a flash file.
    pub fn new(address: u32, data: &'a [u8]) -> Self {
        Self { address, data }
    }
}
