//! 32-byte cube and notification keys.
//!
//! A `CubeKey` identifies a cube: for immutable variants it is the SHA-256
//! hash of the 1024-byte record, for mutable variants it equals the author's
//! public key. A `NotificationKey` has the same representation and is used
//! as a recipient tag on cubes carrying a NOTIFY field.

use crate::error::{Result, VerityError};
use std::fmt;

/// Length of every key and hash in the protocol.
pub const KEY_LEN: usize = 32;

/// Opaque 32-byte cube identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CubeKey([u8; KEY_LEN]);

/// Recipient tag carried in a cube's NOTIFY field. Same format as `CubeKey`;
/// kept as an alias so signatures document which role a key plays.
pub type NotificationKey = CubeKey;

impl CubeKey {
    /// All-zero key, used as the "none" sentinel in wire blobs.
    pub const ZERO: Self = Self([0u8; KEY_LEN]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Normalize a slice into a key, rejecting wrong lengths synchronously.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_LEN {
            return Err(VerityError::BadKeyLength {
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|_| VerityError::BadKeyLength {
            actual: s.len() / 2,
        })?;
        Self::from_slice(&raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }
}

impl AsRef<[u8]> for CubeKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for CubeKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CubeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for CubeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps scheduler traces readable
        write!(f, "CubeKey({}..)", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_validates_length() {
        assert!(CubeKey::from_slice(&[0u8; 32]).is_ok());

        let err = CubeKey::from_slice(&[0u8; 31]).unwrap_err();
        assert!(matches!(err, VerityError::BadKeyLength { actual: 31 }));
    }

    #[test]
    fn hex_round_trip() {
        let key = CubeKey::from_bytes([0x42; 32]);
        let parsed = CubeKey::from_hex(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn zero_sentinel() {
        assert!(CubeKey::ZERO.is_zero());
        assert!(!CubeKey::from_bytes([1; 32]).is_zero());
    }
}
