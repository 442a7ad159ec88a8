//! Content digests, `sha256:<hex>`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parses and validates `sha256:<64 lowercase hex chars>`.
    pub fn parse(s: &str) -> AppResult<Self> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| AppError::BadRequest(format!("digest missing sha256 prefix: {s}")))?;

        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(AppError::BadRequest(format!("malformed digest: {s}")));
        }

        Ok(Digest(s.to_string()))
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Hex-only form, used for blob filenames (`sha256-<hex>`).
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = AppError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}

/// Incremental hasher used while streaming a blob to disk, so the digest is
/// verified without buffering the whole blob in memory.
pub struct DigestWriter {
    hasher: Sha256,
}

impl DigestWriter {
    pub fn new() -> Self {
        DigestWriter {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> Digest {
        Digest(format!("sha256:{:x}", self.hasher.finalize()))
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_prefix() {
        assert!(Digest::parse("deadbeef").is_err());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Digest::parse("sha256:abc").is_err());
    }

    #[test]
    fn rejects_uppercase() {
        let hex = "A".repeat(64);
        assert!(Digest::parse(&format!("sha256:{hex}")).is_err());
    }

    #[test]
    fn accepts_valid_digest() {
        let hex = "a".repeat(64);
        assert!(Digest::parse(&format!("sha256:{hex}")).is_ok());
    }

    #[test]
    fn of_bytes_matches_incremental_writer() {
        let data = b"hello world";
        let whole = Digest::of_bytes(data);

        let mut w = DigestWriter::new();
        w.update(&data[..5]);
        w.update(&data[5..]);
        let streamed = w.finalize();

        assert_eq!(whole, streamed);
    }

    #[test]
    fn hex_strips_prefix() {
        let hex = "b".repeat(64);
        let d = Digest::parse(&format!("sha256:{hex}")).unwrap();
        assert_eq!(d.hex(), hex);
    }
}
