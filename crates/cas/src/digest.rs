//! Content-addressed digest type

use buildstream_core::CasError;
use buildstream_protos::reapi;
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// A content-addressed digest (SHA-256 hash + size).
///
/// Two digests are equal iff both the hash and the size match. The size is
/// kept as `i64` to mirror the wire message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// SHA-256 hash in lowercase hex
    pub hash: String,

    /// Size of the content in bytes
    pub size_bytes: i64,
}

/// Digest of empty content, in "hash/size" format.
pub const EMPTY_DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855/0";

impl Digest {
    /// Create a digest from a hash and size, validating the hash format.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self, CasError> {
        let hash = hash.into();

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CasError::corrupt(
                hash.clone(),
                "expected 64 hex characters of SHA-256",
            ));
        }

        Ok(Self { hash, size_bytes })
    }

    /// Compute the digest of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: bytes.len() as i64,
        }
    }

    /// Compute the digest of a file by streaming its content.
    pub fn from_file(path: &Path) -> Result<Self, CasError> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| CasError::io(format!("open {}", path.display()), e))?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut size = 0i64;
        loop {
            let n = file
                .read(&mut buffer)
                .map_err(|e| CasError::io(format!("read {}", path.display()), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as i64;
        }
        Ok(Self {
            hash: hex::encode(hasher.finalize()),
            size_bytes: size,
        })
    }

    /// Parse a digest from "hash/size" format, as used in ByteStream
    /// resource names.
    pub fn parse(s: &str) -> Result<Self, CasError> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(hash), Some(size), None) => {
                let size_bytes: i64 = size.parse().map_err(|_| {
                    CasError::corrupt(s, "invalid size in digest")
                })?;
                Self::new(hash, size_bytes)
            }
            _ => Err(CasError::corrupt(s, "expected 'hash/size'")),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// Convert to the wire message.
    #[must_use]
    pub fn to_proto(&self) -> reapi::Digest {
        reapi::Digest {
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
        }
    }

    /// Convert from the wire message, validating the hash.
    pub fn from_proto(proto: &reapi::Digest) -> Result<Self, CasError> {
        Self::new(&proto.hash, proto.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::parse(EMPTY_DIGEST).expect("empty digest is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        let digest = Digest::from_bytes(b"hello world");
        assert_eq!(digest.size_bytes, 11);
        assert_eq!(
            digest.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_digest_constant() {
        let empty = Digest::from_bytes(b"");
        assert_eq!(empty, Digest::default());
        assert!(empty.is_empty());
        assert_eq!(empty.to_string(), EMPTY_DIGEST);
    }

    #[test]
    fn test_parse_roundtrip() {
        let digest = Digest::from_bytes(b"content");
        let parsed = Digest::parse(&digest.to_string()).unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Digest::parse("not-a-digest").is_err());
        assert!(Digest::parse("abcd/12").is_err());
        let mut hash = "a".repeat(63);
        hash.push('g');
        assert!(Digest::new(hash, 1).is_err());
    }

    #[test]
    fn test_proto_roundtrip() {
        let digest = Digest::from_bytes(b"proto");
        let back = Digest::from_proto(&digest.to_proto()).unwrap();
        assert_eq!(digest, back);
    }
}
