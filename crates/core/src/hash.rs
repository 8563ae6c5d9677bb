//! Content hashing for the content-addressed file backend.

use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> ContentHasher {
        ContentHasher(Sha256::new())
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str =
                std::str::from_utf8(chunk).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as the two-level directory ident used on disk: `aa/bb/rest`.
    ///
    /// The first two bytes become one directory level each, bounding the
    /// entry count of any single directory to 256.
    pub fn to_ident(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}", &hex[..2], &hex[2..4], &hex[4..])
    }

    /// Parse a two-level directory ident back into a hash.
    pub fn from_ident(ident: &str) -> crate::Result<Self> {
        let mut parts = ident.splitn(3, '/');
        let (a, b, rest) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(rest)) if a.len() == 2 && b.len() == 2 => (a, b, rest),
            _ => {
                return Err(crate::Error::InvalidIdent(format!(
                    "expected aa/bb/rest form, got {ident:?}"
                )));
            }
        };
        Self::from_hex(&format!("{a}{b}{rest}"))
            .map_err(|_| crate::Error::InvalidIdent(ident.to_string()))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental SHA-256 hasher.
pub struct ContentHasher(Sha256);

impl ContentHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> ContentHash {
        ContentHash(self.0.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(b"hello world");
        let hex = hash.to_hex();
        let parsed = ContentHash::from_hex(&hex).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = ContentHash::hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), ContentHash::compute(b"hello world"));
    }

    #[test]
    fn test_ident_roundtrip() {
        let hash = ContentHash::compute(b"content");
        let ident = hash.to_ident();

        // Two directory levels of one byte each, then the remainder.
        let parts: Vec<&str> = ident.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2].len(), 60);

        let parsed = ContentHash::from_ident(&ident).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_ident_rejects_malformed() {
        assert!(ContentHash::from_ident("ab/cd").is_err());
        assert!(ContentHash::from_ident("abc/d/ef").is_err());
        assert!(ContentHash::from_ident("zz/zz/not-hex").is_err());
    }
}
