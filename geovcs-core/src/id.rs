//! Content-addressed object identifiers

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Number of bytes in an object id
pub const NUM_BYTES: usize = 20;

/// SHA-1 identifier of a serialized object
///
/// The all-zero id is reserved as [`ObjectId::NULL`] and denotes "absent".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ObjectId([u8; NUM_BYTES]);

impl ObjectId {
    /// The null id
    pub const NULL: ObjectId = ObjectId([0u8; NUM_BYTES]);

    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; NUM_BYTES]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        Self(hash.into())
    }

    /// Build an id from a 20 byte slice, `None` if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; NUM_BYTES] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a full 40 character hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidArgument(format!("invalid object id '{}': {}", hex_str, e)))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            Error::InvalidArgument(format!("invalid object id length: '{}'", hex_str))
        })
    }

    /// Whether `s` looks like a full hex id
    pub fn is_hex_id(s: &str) -> bool {
        s.len() == NUM_BYTES * 2 && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NUM_BYTES] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == [0u8; NUM_BYTES]
    }

    /// Whether the hex form of this id starts with `prefix` (case insensitive)
    pub fn has_hex_prefix(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(&prefix.to_ascii_lowercase())
    }

    /// Abbreviated hex form, used in log messages
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.short())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = ObjectId::from_data(b"hello");
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
        assert!(ObjectId::is_hex_id(&hex));
    }

    #[test]
    fn test_sha1_of_known_input() {
        let id = ObjectId::from_data(b"abc");
        assert_eq!(id.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_null_id() {
        assert!(ObjectId::NULL.is_null());
        assert!(!ObjectId::from_data(b"x").is_null());
        assert_eq!(ObjectId::default(), ObjectId::NULL);
    }

    #[test]
    fn test_invalid_hex_is_rejected() {
        assert!(ObjectId::from_hex("zz").is_err());
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_prefix_match() {
        let id = ObjectId::from_data(b"abc");
        assert!(id.has_hex_prefix("a999"));
        assert!(id.has_hex_prefix("A999"));
        assert!(!id.has_hex_prefix("a998"));
    }
}
