//! Cube variants, metadata, and the fixed 1024-byte binary layout.
//!
//! The cube codec lives here: building a binary record from fields and
//! decoding a received record into `CubeInfo`. Decoding is structural
//! validation only; proof-of-work is checked separately via
//! [`CubeInfo::verify_difficulty`] so nodes with difficulty 0 skip it,
//! and signature verification is a pluggable codec concern.
//!
//! Layout (big-endian):
//!
//! ```text
//! [variant u8][flags u8][date u64][counter u64]
//! [author key 32][notify key 32][payload len u16][payload ...][zero padding]
//! ```

use crate::error::{Result, VerityError};
use crate::key::{CubeKey, NotificationKey, KEY_LEN};
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

/// Every cube is exactly this many bytes.
pub const CUBE_SIZE: usize = 1024;

/// Fixed header: variant + flags + date + counter + author + notify + len.
pub const CUBE_HEADER_SIZE: usize = 1 + 1 + 8 + 8 + KEY_LEN + KEY_LEN + 2;

/// Maximum payload a single cube can carry.
pub const MAX_PAYLOAD_SIZE: usize = CUBE_SIZE - CUBE_HEADER_SIZE;

/// Flag bit: the notify key field is meaningful.
const FLAG_NOTIFY: u8 = 0x01;

/// Cube variants relevant to the retrieval core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubeVariant {
    /// Immutable, identified by content hash.
    Frozen,
    /// Immutable content, identified by content hash.
    Pic,
    /// Mutable user cube, identified by author key, versioned by date.
    Muc,
    /// Persistent MUC with an explicit update counter as primary version.
    Pmuc,
}

impl CubeVariant {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Frozen => 0x01,
            Self::Pic => 0x02,
            Self::Muc => 0x03,
            Self::Pmuc => 0x04,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Frozen),
            0x02 => Some(Self::Pic),
            0x03 => Some(Self::Muc),
            0x04 => Some(Self::Pmuc),
            _ => None,
        }
    }

    /// Mutable cubes are keyed by the author's public key.
    #[must_use]
    pub const fn is_mutable(&self) -> bool {
        matches!(self, Self::Muc | Self::Pmuc)
    }

    #[must_use]
    pub const fn is_immutable(&self) -> bool {
        !self.is_mutable()
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Frozen => "FROZEN",
            Self::Pic => "PIC",
            Self::Muc => "MUC",
            Self::Pmuc => "PMUC",
        }
    }
}

/// SHA-256 of a binary record.
#[must_use]
pub fn content_hash(blob: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    hasher.finalize().into()
}

/// Proof-of-work difficulty: count of trailing zero bits in the hash.
#[must_use]
pub fn hash_difficulty(hash: &[u8; KEY_LEN]) -> u8 {
    let mut bits = 0u16;
    for byte in hash.iter().rev() {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += u16::from(byte.trailing_zeros() as u8);
            break;
        }
    }
    // An all-zero hash cannot occur for real records; clamp for the type.
    bits.min(u16::from(u8::MAX)) as u8
}

/// Field set for building a binary cube.
#[derive(Debug, Clone)]
pub struct CubeFields {
    pub variant: CubeVariant,
    /// Declared timestamp, epoch seconds.
    pub date: u64,
    /// PMUC update counter; ignored for other variants.
    pub counter: u64,
    /// Author public key; required for mutable variants.
    pub author: Option<CubeKey>,
    /// Recipient tag; sets the NOTIFY flag when present.
    pub notify: Option<NotificationKey>,
    pub payload: Bytes,
}

impl CubeFields {
    #[must_use]
    pub fn new(variant: CubeVariant) -> Self {
        Self {
            variant,
            date: 0,
            counter: 0,
            author: None,
            notify: None,
            payload: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_date(mut self, date: u64) -> Self {
        self.date = date;
        self
    }

    #[must_use]
    pub fn with_counter(mut self, counter: u64) -> Self {
        self.counter = counter;
        self
    }

    #[must_use]
    pub fn with_author(mut self, author: CubeKey) -> Self {
        self.author = Some(author);
        self
    }

    #[must_use]
    pub fn with_notify(mut self, notify: NotificationKey) -> Self {
        self.notify = Some(notify);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize into a 1024-byte binary record.
    pub fn build(self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(VerityError::bad_cube(format!(
                "payload {} bytes exceeds {MAX_PAYLOAD_SIZE}",
                self.payload.len()
            )));
        }
        if self.variant.is_mutable() && self.author.is_none() {
            return Err(VerityError::bad_cube(format!(
                "{} cube requires an author key",
                self.variant.as_str()
            )));
        }

        let mut out = BytesMut::with_capacity(CUBE_SIZE);
        out.extend_from_slice(&[self.variant.tag()]);

        let mut flags = 0u8;
        if self.notify.is_some() {
            flags |= FLAG_NOTIFY;
        }
        out.extend_from_slice(&[flags]);

        out.extend_from_slice(&self.date.to_be_bytes());
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(self.author.unwrap_or(CubeKey::ZERO).as_bytes());
        out.extend_from_slice(self.notify.unwrap_or(CubeKey::ZERO).as_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.resize(CUBE_SIZE, 0);

        Ok(out.freeze())
    }
}

/// Metadata for one stored or offered cube.
///
/// `blob` is `Some` for cubes we hold in full and `None` for remote offers
/// (KeyResponse entries carry metadata only; the remote decides whether to
/// fetch the record itself).
#[derive(Debug, Clone)]
pub struct CubeInfo {
    pub key: CubeKey,
    pub variant: CubeVariant,
    pub date: u64,
    pub counter: u64,
    pub difficulty: u8,
    pub notify: Option<NotificationKey>,
    pub hash: [u8; KEY_LEN],
    pub blob: Option<Bytes>,
}

impl CubeInfo {
    /// Decode and structurally validate a binary record.
    pub fn decode(blob: Bytes) -> Result<Self> {
        if blob.len() != CUBE_SIZE {
            return Err(VerityError::bad_cube(format!(
                "record is {} bytes (expected {CUBE_SIZE})",
                blob.len()
            )));
        }

        let variant = CubeVariant::from_tag(blob[0])
            .ok_or_else(|| VerityError::bad_cube(format!("unknown variant tag {:#04x}", blob[0])))?;

        let flags = blob[1];
        if flags & !FLAG_NOTIFY != 0 {
            return Err(VerityError::bad_cube(format!(
                "unknown flag bits {flags:#04x}"
            )));
        }

        let date = u64::from_be_bytes(blob[2..10].try_into().expect("fixed slice"));
        let counter = u64::from_be_bytes(blob[10..18].try_into().expect("fixed slice"));
        let author = CubeKey::from_slice(&blob[18..18 + KEY_LEN]).expect("fixed slice");
        let notify_raw = CubeKey::from_slice(&blob[50..50 + KEY_LEN]).expect("fixed slice");

        let payload_len = u16::from_be_bytes(blob[82..84].try_into().expect("fixed slice")) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(VerityError::bad_cube(format!(
                "payload length {payload_len} exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }

        if variant.is_mutable() && author.is_zero() {
            return Err(VerityError::bad_cube("mutable cube with zero author key"));
        }

        let notify = if flags & FLAG_NOTIFY != 0 {
            if notify_raw.is_zero() {
                return Err(VerityError::bad_cube("NOTIFY flag with zero recipient key"));
            }
            Some(notify_raw)
        } else {
            None
        };

        let hash = content_hash(&blob);
        let difficulty = hash_difficulty(&hash);
        let key = if variant.is_mutable() {
            author
        } else {
            CubeKey::from_bytes(hash)
        };

        Ok(Self {
            key,
            variant,
            date,
            counter,
            difficulty,
            notify,
            hash,
            blob: Some(blob),
        })
    }

    /// Check proof-of-work against a configured threshold.
    pub fn verify_difficulty(&self, required: u8) -> Result<()> {
        if self.difficulty < required {
            return Err(VerityError::InsufficientDifficulty {
                required,
                actual: self.difficulty,
            });
        }
        Ok(())
    }

    /// Payload bytes, when the full record is held.
    #[must_use]
    pub fn payload(&self) -> Option<Bytes> {
        let blob = self.blob.as_ref()?;
        let len = u16::from_be_bytes(blob[82..84].try_into().ok()?) as usize;
        Some(blob.slice(CUBE_HEADER_SIZE..CUBE_HEADER_SIZE + len))
    }

    /// Payload as UTF-8, for text-carrying cubes.
    #[must_use]
    pub fn payload_string(&self) -> Option<String> {
        let payload = self.payload()?;
        String::from_utf8(payload.to_vec()).ok()
    }

    /// Rebuild the record with a new PMUC update counter.
    ///
    /// Used by stores honoring `auto_increment_pmuc` for locally authored
    /// cubes. Hash, difficulty, and (for immutable variants) the key are
    /// recomputed from the patched record.
    pub fn with_counter(&self, counter: u64) -> Result<Self> {
        let blob = self
            .blob
            .as_ref()
            .ok_or_else(|| VerityError::bad_cube("cannot rewrite a record without its blob"))?;
        let mut patched = BytesMut::from(blob.as_ref());
        patched[10..18].copy_from_slice(&counter.to_be_bytes());
        Self::decode(patched.freeze())
    }

    /// Metadata-only copy for KeyResponse offers.
    #[must_use]
    pub fn offer(&self) -> Self {
        Self {
            blob: None,
            ..self.clone()
        }
    }

    #[inline]
    #[must_use]
    pub const fn has_blob(&self) -> bool {
        self.blob.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_round_trip() {
        let blob = CubeFields::new(CubeVariant::Frozen)
            .with_date(1_000_000)
            .with_payload(&b"cubus sum"[..])
            .build()
            .unwrap();
        assert_eq!(blob.len(), CUBE_SIZE);

        let info = CubeInfo::decode(blob.clone()).unwrap();
        assert_eq!(info.variant, CubeVariant::Frozen);
        assert_eq!(info.date, 1_000_000);
        assert_eq!(info.key.as_bytes(), &content_hash(&blob));
        assert_eq!(info.payload_string().unwrap(), "cubus sum");
        assert!(info.notify.is_none());
    }

    #[test]
    fn muc_keyed_by_author() {
        let author = CubeKey::from_bytes([7u8; 32]);
        let blob = CubeFields::new(CubeVariant::Muc)
            .with_author(author)
            .with_date(1_000_001)
            .with_payload(&b"cubus usoris mutabilis sum"[..])
            .build()
            .unwrap();

        let info = CubeInfo::decode(blob).unwrap();
        assert_eq!(info.key, author);
        assert!(info.variant.is_mutable());
    }

    #[test]
    fn notify_flag_round_trip() {
        let recipient = CubeKey::from_bytes([0x42; 32]);
        let blob = CubeFields::new(CubeVariant::Pic)
            .with_notify(recipient)
            .with_payload(&b"Quaeso meam existentia cognoscas"[..])
            .build()
            .unwrap();

        let info = CubeInfo::decode(blob).unwrap();
        assert_eq!(info.notify, Some(recipient));
    }

    #[test]
    fn rejects_bad_records() {
        assert!(CubeInfo::decode(Bytes::from_static(&[0u8; 100])).is_err());

        // Unknown variant tag
        let mut raw = vec![0u8; CUBE_SIZE];
        raw[0] = 0x7F;
        assert!(CubeInfo::decode(Bytes::from(raw)).is_err());

        // Mutable cube without an author
        assert!(CubeFields::new(CubeVariant::Muc)
            .with_date(1)
            .build()
            .is_err());

        // Oversized payload
        assert!(CubeFields::new(CubeVariant::Frozen)
            .with_payload(vec![1u8; MAX_PAYLOAD_SIZE + 1])
            .build()
            .is_err());
    }

    #[test]
    fn difficulty_counts_trailing_zero_bits() {
        let mut hash = [0xFFu8; KEY_LEN];
        assert_eq!(hash_difficulty(&hash), 0);

        hash[31] = 0x00;
        hash[30] = 0x04; // ...0000_0100 -> 8 + 2 trailing zeros
        assert_eq!(hash_difficulty(&hash), 10);

        assert_eq!(hash_difficulty(&[0u8; KEY_LEN]), 255);
    }

    #[test]
    fn offer_drops_blob() {
        let blob = CubeFields::new(CubeVariant::Pic)
            .with_payload(&b"x"[..])
            .build()
            .unwrap();
        let info = CubeInfo::decode(blob).unwrap();
        let offer = info.offer();
        assert!(!offer.has_blob());
        assert_eq!(offer.key, info.key);
        assert_eq!(offer.hash, info.hash);
    }
}
