//! SHA-256 checks against detached `.sha256` files.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a hex-encoded SHA-256 digest.
const SHA256_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Parsed content of a `.sha256` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumFile {
    /// Lowercase hex digest.
    pub digest: String,
    /// File name the digest belongs to, when given.
    pub filename: Option<String>,
}

impl ChecksumFile {
    /// Parse `<hex> <filename>`, the `sha256sum` binary form
    /// `<hex>  *<filename>`, or a bare digest. Only the first non-empty line
    /// is read.
    pub fn parse(content: &str) -> Result<Self> {
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::InvalidChecksum("checksum file is empty".into()))?;

        let mut parts = line.splitn(2, char::is_whitespace);
        let digest = parts.next().unwrap_or_default();
        let filename = parts
            .next()
            .map(|rest| rest.trim_start().trim_start_matches('*'))
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(Self {
            digest: normalize_digest(digest)?,
            filename,
        })
    }

    /// Check `data` against this digest.
    pub fn verify(&self, name: &str, data: &[u8]) -> Result<()> {
        verify_named(name, data, &self.digest)
    }
}

/// Check `data` against `expected_hex`.
///
/// A mismatch is [`Error::Integrity`]; a malformed digest is
/// [`Error::InvalidChecksum`].
pub fn verify(data: &[u8], expected_hex: &str) -> Result<()> {
    verify_named("image", data, expected_hex)
}

fn verify_named(name: &str, data: &[u8], expected_hex: &str) -> Result<()> {
    let expected = normalize_digest(expected_hex)?;
    let actual = sha256_hex(data);
    if actual != expected {
        return Err(Error::Integrity {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn normalize_digest(digest: &str) -> Result<String> {
    let digest = digest.trim().to_ascii_lowercase();
    if digest.len() != SHA256_HEX_LEN || hex::decode(&digest).is_err() {
        return Err(Error::InvalidChecksum(format!(
            "'{digest}' is not a SHA-256 hex digest"
        )));
    }
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    // sha256("abc")
    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_sha256_hex() {
        assert_eq!(sha256_hex(b"abc"), ABC);
    }

    #[test]
    fn test_verify_accepts_matching_digest() {
        assert!(verify(b"abc", ABC).is_ok());
        assert!(verify(b"abc", &ABC.to_uppercase()).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_digest() {
        let other = sha256_hex(b"abd");
        let err = verify(b"abc", &other).unwrap_err();
        assert!(matches!(err, Error::Integrity { ref expected, ref actual, .. }
            if *expected == other && actual == ABC));
    }

    #[test]
    fn test_verify_malformed_digest() {
        assert!(matches!(verify(b"abc", "xyz"), Err(Error::InvalidChecksum(_))));
    }

    #[test]
    fn test_parse_text_and_binary_forms() {
        let text = ChecksumFile::parse(&format!("{ABC} meshgrid-heltec_v3-0.0.8.bin\n")).unwrap();
        assert_eq!(text.digest, ABC);
        assert_eq!(text.filename.as_deref(), Some("meshgrid-heltec_v3-0.0.8.bin"));

        let binary = ChecksumFile::parse(&format!("{ABC}  *fw.bin")).unwrap();
        assert_eq!(binary.filename.as_deref(), Some("fw.bin"));

        let bare = ChecksumFile::parse(&format!("\n{ABC}\n")).unwrap();
        assert_eq!(bare.filename, None);
        assert!(bare.verify("fw.bin", b"abc").is_ok());
    }

    #[test]
    fn test_parse_empty_file() {
        assert!(matches!(ChecksumFile::parse("  \n"), Err(Error::InvalidChecksum(_))));
    }
}
