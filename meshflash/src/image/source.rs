//! Image sources.
//!
//! An [`ImageSource`] serves release images by file name plus their detached
//! checksums. A missing image is an availability error ([`Error::NotFound`]);
//! a missing checksum is not an error at all, the image is just accepted
//! unverified. A checksum that does not match is always fatal.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::checksum::ChecksumFile;
use super::{FirmwareImage, Provenance, Verification};
use crate::catalog::MERGED_IMAGE_ADDRESS;
use crate::error::{Error, Result};

/// Supplier of release images.
pub trait ImageSource {
    /// Fetch the image called `name`.
    fn fetch(&mut self, name: &str) -> Result<Vec<u8>>;

    /// Fetch the text of `name`'s `.sha256` file, `None` if none is published.
    fn fetch_checksum(&mut self, name: &str) -> Result<Option<String>>;
}

/// Serves a local release directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Serve files from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        // Names come from the catalog or the command line; never leave root.
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(Error::InvalidImage(format!("'{name}' is not a plain file name")));
        }
        Ok(self.root.join(name))
    }
}

impl ImageSource for DirectorySource {
    fn fetch(&mut self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_of(name)?;
        debug!("Loading image from {}", path.display());
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(format!(
                "firmware {name} not found in {}",
                self.root.display()
            )),
            _ => Error::Io(e),
        })
    }

    fn fetch_checksum(&mut self, name: &str) -> Result<Option<String>> {
        let path = self.path_of(&format!("{name}.sha256"))?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Fetch a release image and check it against its published checksum.
///
/// The image is placed at [`MERGED_IMAGE_ADDRESS`].
pub fn load_catalog_image<S: ImageSource + ?Sized>(source: &mut S, name: &str) -> Result<FirmwareImage> {
    let data = source.fetch(name)?;

    let verification = match source.fetch_checksum(name)? {
        Some(text) => {
            ChecksumFile::parse(&text)?.verify(name, &data)?;
            info!("Checksum verified for {name}");
            Verification::Verified
        },
        None => {
            warn!("No checksum published for {name}; continuing unverified");
            Verification::Unverified
        },
    };

    Ok(FirmwareImage {
        data,
        address: MERGED_IMAGE_ADDRESS,
        provenance: Some(Provenance {
            filename: name.to_string(),
            verification,
        }),
    })
}

/// Load a user-supplied image from `path`, placed at
/// [`MERGED_IMAGE_ADDRESS`].
pub fn load_file(path: impl AsRef<Path>) -> Result<FirmwareImage> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(format!("{} does not exist", path.display())),
        _ => Error::Io(e),
    })?;
    if data.is_empty() {
        return Err(Error::InvalidImage(format!("{} is empty", path.display())));
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok(FirmwareImage {
        data,
        address: MERGED_IMAGE_ADDRESS,
        provenance: Some(Provenance {
            filename,
            verification: Verification::NotApplicable,
        }),
    })
}
