//! Typed wire messages.
//!
//! Every message class is an explicit tagged variant with its own binary
//! body layout; keys and hashes are always 32 bytes. Encoding produces a
//! complete frame (length prefix + version + tag + body); decoding takes a
//! [`Frame`] from the codec.

use crate::codec::{encode_frame, Frame, Result, WireError};
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;
use verity_core::cube::{CubeInfo, CubeVariant, CUBE_SIZE};
use verity_core::key::{CubeKey, NotificationKey, KEY_LEN};
use verity_core::peer::NodeType;

/// Maximum cube keys in one request / subscribe message.
pub const MAX_KEYS_PER_MESSAGE: usize = 128;

/// Maximum full cubes in one response; also the pacing batch size.
pub const MAX_CUBES_PER_MESSAGE: usize = 32;

/// Inline capacity for key batches; most messages carry a handful.
pub type KeyBatch = SmallVec<[CubeKey; 4]>;

/// Request mode carried by `KeyRequest` / `KeyResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequestMode {
    /// Full catalog walk, used by full nodes to sync stores.
    SequentialStoreSync,
    NotificationChallenge,
    NotificationTimestamp,
    /// Unsolicited push of fresh keys; receiver decides whether to fetch.
    ExpressSync,
}

impl KeyRequestMode {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::SequentialStoreSync => 0x01,
            Self::NotificationChallenge => 0x02,
            Self::NotificationTimestamp => 0x03,
            Self::ExpressSync => 0x04,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::SequentialStoreSync),
            0x02 => Some(Self::NotificationChallenge),
            0x03 => Some(Self::NotificationTimestamp),
            0x04 => Some(Self::ExpressSync),
            _ => None,
        }
    }
}

/// Optional constraints on a `KeyRequest`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyFilter {
    /// Only keys of cubes notifying this recipient.
    pub notifies: Option<NotificationKey>,
    pub time_min: Option<u64>,
    pub time_max: Option<u64>,
}

impl KeyFilter {
    #[must_use]
    pub const fn notifying(recipient: NotificationKey) -> Self {
        Self {
            notifies: Some(recipient),
            time_min: None,
            time_max: None,
        }
    }

    const FLAG_NOTIFIES: u8 = 0x01;
    const FLAG_TIME_MIN: u8 = 0x02;
    const FLAG_TIME_MAX: u8 = 0x04;
}

/// What a subscribe message asks the remote to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Cube,
    Notifications,
}

impl SubscriptionKind {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Cube => 0x01,
            Self::Notifications => 0x02,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Cube),
            0x02 => Some(Self::Notifications),
            _ => None,
        }
    }
}

/// Server verdict inside a `SubscriptionConfirmation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Granted,
    Declined,
}

impl ResponseCode {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Granted => 0x01,
            Self::Declined => 0x02,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Granted),
            0x02 => Some(Self::Declined),
            _ => None,
        }
    }
}

/// Body of a `SubscriptionConfirmation`.
#[derive(Debug, Clone, Copy)]
pub struct Confirmation {
    pub code: ResponseCode,
    /// The key blob the client asked for: the single key, or the hash of
    /// the concatenated keys for a multi-key subscribe.
    pub requested_key_blob: CubeKey,
    /// Hash of what the server currently stores; zero for "none".
    pub cubes_hash_blob: CubeKey,
    pub duration_ms: u64,
}

/// The key blob identifying a subscribe request: the single key if one,
/// else the hash of the concatenation.
#[must_use]
pub fn key_blob(keys: &[CubeKey]) -> CubeKey {
    if keys.len() == 1 {
        return keys[0];
    }
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
    }
    CubeKey::from_bytes(hasher.finalize().into())
}

/// All wire message classes.
#[derive(Debug, Clone)]
pub enum Message {
    /// Node-type exchange, first frame on every connection.
    Hello { node_type: NodeType },
    CubeRequest { keys: KeyBatch },
    CubeResponse { cubes: Vec<Bytes> },
    /// Same shape as `CubeRequest`, distinct class tag.
    NotificationRequest { recipients: KeyBatch },
    KeyRequest { mode: KeyRequestMode, filter: KeyFilter },
    KeyResponse { mode: KeyRequestMode, infos: Vec<CubeInfo> },
    SubscribeCube { kind: SubscriptionKind, keys: KeyBatch },
    SubscriptionConfirmation(Confirmation),
}

const TAG_HELLO: u8 = 0x01;
const TAG_CUBE_REQUEST: u8 = 0x02;
const TAG_CUBE_RESPONSE: u8 = 0x03;
const TAG_NOTIFICATION_REQUEST: u8 = 0x04;
const TAG_KEY_REQUEST: u8 = 0x05;
const TAG_KEY_RESPONSE: u8 = 0x06;
const TAG_SUBSCRIBE_CUBE: u8 = 0x07;
const TAG_SUBSCRIPTION_CONFIRMATION: u8 = 0x08;

/// Flag bit in a wire cube-info entry: notify key present.
const INFO_FLAG_NOTIFY: u8 = 0x01;

impl Message {
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => TAG_HELLO,
            Self::CubeRequest { .. } => TAG_CUBE_REQUEST,
            Self::CubeResponse { .. } => TAG_CUBE_RESPONSE,
            Self::NotificationRequest { .. } => TAG_NOTIFICATION_REQUEST,
            Self::KeyRequest { .. } => TAG_KEY_REQUEST,
            Self::KeyResponse { .. } => TAG_KEY_RESPONSE,
            Self::SubscribeCube { .. } => TAG_SUBSCRIBE_CUBE,
            Self::SubscriptionConfirmation(_) => TAG_SUBSCRIPTION_CONFIRMATION,
        }
    }

    /// Encode into a complete frame, enforcing batch limits.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64);

        match self {
            Self::Hello { node_type } => {
                body.extend_from_slice(&[node_type.tag()]);
            }

            Self::CubeRequest { keys } | Self::NotificationRequest { recipients: keys } => {
                check_batch(keys.len(), MAX_KEYS_PER_MESSAGE)?;
                body.extend_from_slice(&(keys.len() as u16).to_be_bytes());
                for key in keys {
                    body.extend_from_slice(key.as_bytes());
                }
            }

            Self::CubeResponse { cubes } => {
                check_batch(cubes.len(), MAX_CUBES_PER_MESSAGE)?;
                body.extend_from_slice(&(cubes.len() as u16).to_be_bytes());
                for cube in cubes {
                    if cube.len() != CUBE_SIZE {
                        return Err(WireError::Malformed("cube record is not 1024 bytes"));
                    }
                    body.extend_from_slice(cube);
                }
            }

            Self::KeyRequest { mode, filter } => {
                body.extend_from_slice(&[mode.tag()]);
                let mut flags = 0u8;
                if filter.notifies.is_some() {
                    flags |= KeyFilter::FLAG_NOTIFIES;
                }
                if filter.time_min.is_some() {
                    flags |= KeyFilter::FLAG_TIME_MIN;
                }
                if filter.time_max.is_some() {
                    flags |= KeyFilter::FLAG_TIME_MAX;
                }
                body.extend_from_slice(&[flags]);
                if let Some(notifies) = filter.notifies {
                    body.extend_from_slice(notifies.as_bytes());
                }
                if let Some(time_min) = filter.time_min {
                    body.extend_from_slice(&time_min.to_be_bytes());
                }
                if let Some(time_max) = filter.time_max {
                    body.extend_from_slice(&time_max.to_be_bytes());
                }
            }

            Self::KeyResponse { mode, infos } => {
                check_batch(infos.len(), MAX_KEYS_PER_MESSAGE)?;
                body.extend_from_slice(&[mode.tag()]);
                body.extend_from_slice(&(infos.len() as u16).to_be_bytes());
                for info in infos {
                    encode_info(&mut body, info);
                }
            }

            Self::SubscribeCube { kind, keys } => {
                check_batch(keys.len(), MAX_KEYS_PER_MESSAGE)?;
                body.extend_from_slice(&[kind.tag()]);
                body.extend_from_slice(&(keys.len() as u16).to_be_bytes());
                for key in keys {
                    body.extend_from_slice(key.as_bytes());
                }
            }

            Self::SubscriptionConfirmation(conf) => {
                body.extend_from_slice(&[conf.code.tag()]);
                body.extend_from_slice(conf.requested_key_blob.as_bytes());
                body.extend_from_slice(conf.cubes_hash_blob.as_bytes());
                body.extend_from_slice(&conf.duration_ms.to_be_bytes());
            }
        }

        Ok(encode_frame(self.tag(), &body))
    }

    /// Decode a frame body into a typed message.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let mut r = Reader::new(&frame.body);

        let msg = match frame.tag {
            TAG_HELLO => {
                let node_type = NodeType::from_tag(r.u8()?)
                    .ok_or(WireError::Malformed("unknown node type"))?;
                Self::Hello { node_type }
            }

            TAG_CUBE_REQUEST => Self::CubeRequest { keys: r.keys()? },
            TAG_NOTIFICATION_REQUEST => Self::NotificationRequest {
                recipients: r.keys()?,
            },

            TAG_CUBE_RESPONSE => {
                let count = r.u16()? as usize;
                if count > MAX_CUBES_PER_MESSAGE {
                    return Err(WireError::BatchTooLarge {
                        len: count,
                        max: MAX_CUBES_PER_MESSAGE,
                    });
                }
                let mut cubes = Vec::with_capacity(count);
                for _ in 0..count {
                    cubes.push(r.bytes(CUBE_SIZE)?);
                }
                Self::CubeResponse { cubes }
            }

            TAG_KEY_REQUEST => {
                let mode = KeyRequestMode::from_tag(r.u8()?)
                    .ok_or(WireError::Malformed("unknown key-request mode"))?;
                let flags = r.u8()?;
                let mut filter = KeyFilter::default();
                if flags & KeyFilter::FLAG_NOTIFIES != 0 {
                    filter.notifies = Some(r.key()?);
                }
                if flags & KeyFilter::FLAG_TIME_MIN != 0 {
                    filter.time_min = Some(r.u64()?);
                }
                if flags & KeyFilter::FLAG_TIME_MAX != 0 {
                    filter.time_max = Some(r.u64()?);
                }
                Self::KeyRequest { mode, filter }
            }

            TAG_KEY_RESPONSE => {
                let mode = KeyRequestMode::from_tag(r.u8()?)
                    .ok_or(WireError::Malformed("unknown key-response mode"))?;
                let count = r.u16()? as usize;
                if count > MAX_KEYS_PER_MESSAGE {
                    return Err(WireError::BatchTooLarge {
                        len: count,
                        max: MAX_KEYS_PER_MESSAGE,
                    });
                }
                let mut infos = Vec::with_capacity(count);
                for _ in 0..count {
                    infos.push(decode_info(&mut r)?);
                }
                Self::KeyResponse { mode, infos }
            }

            TAG_SUBSCRIBE_CUBE => {
                let kind = SubscriptionKind::from_tag(r.u8()?)
                    .ok_or(WireError::Malformed("unknown subscription kind"))?;
                Self::SubscribeCube {
                    kind,
                    keys: r.keys()?,
                }
            }

            TAG_SUBSCRIPTION_CONFIRMATION => {
                let code = ResponseCode::from_tag(r.u8()?)
                    .ok_or(WireError::Malformed("unknown response code"))?;
                Self::SubscriptionConfirmation(Confirmation {
                    code,
                    requested_key_blob: r.key()?,
                    cubes_hash_blob: r.key()?,
                    duration_ms: r.u64()?,
                })
            }

            other => return Err(WireError::UnknownTag(other)),
        };

        if !r.is_empty() {
            return Err(WireError::Malformed("trailing bytes after message body"));
        }
        Ok(msg)
    }
}

fn check_batch(len: usize, max: usize) -> Result<()> {
    if len == 0 {
        return Err(WireError::Malformed("empty batch"));
    }
    if len > max {
        return Err(WireError::BatchTooLarge { len, max });
    }
    Ok(())
}

/// Wire cube-info entry:
/// `[key 32][variant u8][flags u8][date u64][counter u64][difficulty u8][hash 32][notify 32?]`
fn encode_info(body: &mut BytesMut, info: &CubeInfo) {
    body.extend_from_slice(info.key.as_bytes());
    body.extend_from_slice(&[info.variant.tag()]);
    let flags = if info.notify.is_some() {
        INFO_FLAG_NOTIFY
    } else {
        0
    };
    body.extend_from_slice(&[flags]);
    body.extend_from_slice(&info.date.to_be_bytes());
    body.extend_from_slice(&info.counter.to_be_bytes());
    body.extend_from_slice(&[info.difficulty]);
    body.extend_from_slice(&info.hash);
    if let Some(notify) = info.notify {
        body.extend_from_slice(notify.as_bytes());
    }
}

fn decode_info(r: &mut Reader<'_>) -> Result<CubeInfo> {
    let key = r.key()?;
    let variant =
        CubeVariant::from_tag(r.u8()?).ok_or(WireError::Malformed("unknown cube variant"))?;
    let flags = r.u8()?;
    if flags & !INFO_FLAG_NOTIFY != 0 {
        return Err(WireError::Malformed("unknown cube-info flags"));
    }
    let date = r.u64()?;
    let counter = r.u64()?;
    let difficulty = r.u8()?;
    let mut hash = [0u8; KEY_LEN];
    hash.copy_from_slice(r.slice(KEY_LEN)?);
    let notify = if flags & INFO_FLAG_NOTIFY != 0 {
        Some(r.key()?)
    } else {
        None
    };

    Ok(CubeInfo {
        key,
        variant,
        date,
        counter,
        difficulty,
        notify,
        hash,
        blob: None,
    })
}

/// Bounds-checked cursor over a message body.
struct Reader<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.pos + len {
            return Err(WireError::Malformed("truncated message body"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.buf.len() < self.pos + len {
            return Err(WireError::Malformed("truncated message body"));
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.slice(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.slice(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.slice(8)?;
        Ok(u64::from_be_bytes(raw.try_into().expect("fixed slice")))
    }

    fn key(&mut self) -> Result<CubeKey> {
        let raw = self.slice(KEY_LEN)?;
        CubeKey::from_slice(raw).map_err(|_| WireError::Malformed("bad key"))
    }

    fn keys(&mut self) -> Result<KeyBatch> {
        let count = self.u16()? as usize;
        if count == 0 {
            return Err(WireError::Malformed("empty batch"));
        }
        if count > MAX_KEYS_PER_MESSAGE {
            return Err(WireError::BatchTooLarge {
                len: count,
                max: MAX_KEYS_PER_MESSAGE,
            });
        }
        let mut keys = KeyBatch::with_capacity(count);
        for _ in 0..count {
            keys.push(self.key()?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameDecoder;
    use smallvec::smallvec;
    use verity_core::cube::CubeFields;

    fn round_trip(msg: &Message) -> Message {
        let encoded = msg.encode().unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let frame = decoder.decode().unwrap().unwrap();
        Message::decode(&frame).unwrap()
    }

    #[test]
    fn cube_request_round_trip_is_byte_identical() {
        let msg = Message::CubeRequest {
            keys: smallvec![CubeKey::from_bytes([1; 32]), CubeKey::from_bytes([2; 32])],
        };

        let first = msg.encode().unwrap();
        let reparsed = round_trip(&msg);
        assert_eq!(reparsed.encode().unwrap(), first);

        match reparsed {
            Message::CubeRequest { keys } => assert_eq!(keys.len(), 2),
            other => panic!("wrong class: {other:?}"),
        }
    }

    #[test]
    fn notification_request_keeps_distinct_tag() {
        let cube = Message::CubeRequest {
            keys: smallvec![CubeKey::from_bytes([1; 32])],
        };
        let notif = Message::NotificationRequest {
            recipients: smallvec![CubeKey::from_bytes([1; 32])],
        };
        assert_ne!(cube.tag(), notif.tag());
        assert!(matches!(
            round_trip(&notif),
            Message::NotificationRequest { .. }
        ));
    }

    #[test]
    fn key_request_filter_round_trip() {
        let msg = Message::KeyRequest {
            mode: KeyRequestMode::NotificationTimestamp,
            filter: KeyFilter {
                notifies: Some(CubeKey::from_bytes([0x42; 32])),
                time_min: Some(5),
                time_max: None,
            },
        };

        match round_trip(&msg) {
            Message::KeyRequest { mode, filter } => {
                assert_eq!(mode, KeyRequestMode::NotificationTimestamp);
                assert_eq!(filter.notifies, Some(CubeKey::from_bytes([0x42; 32])));
                assert_eq!(filter.time_min, Some(5));
                assert_eq!(filter.time_max, None);
            }
            other => panic!("wrong class: {other:?}"),
        }
    }

    #[test]
    fn key_response_carries_offer_metadata() {
        let blob = CubeFields::new(CubeVariant::Pic)
            .with_notify(CubeKey::from_bytes([0x42; 32]))
            .with_date(77)
            .with_payload(&b"offer"[..])
            .build()
            .unwrap();
        let info = CubeInfo::decode(blob).unwrap().offer();

        let msg = Message::KeyResponse {
            mode: KeyRequestMode::ExpressSync,
            infos: vec![info.clone()],
        };

        match round_trip(&msg) {
            Message::KeyResponse { mode, infos } => {
                assert_eq!(mode, KeyRequestMode::ExpressSync);
                assert_eq!(infos[0].key, info.key);
                assert_eq!(infos[0].date, 77);
                assert_eq!(infos[0].notify, info.notify);
                assert_eq!(infos[0].hash, info.hash);
                assert!(!infos[0].has_blob());
            }
            other => panic!("wrong class: {other:?}"),
        }
    }

    #[test]
    fn cube_response_round_trip() {
        let blob = CubeFields::new(CubeVariant::Frozen)
            .with_payload(&b"cubus sum"[..])
            .build()
            .unwrap();
        let msg = Message::CubeResponse {
            cubes: vec![blob.clone()],
        };

        match round_trip(&msg) {
            Message::CubeResponse { cubes } => assert_eq!(cubes[0], blob),
            other => panic!("wrong class: {other:?}"),
        }
    }

    #[test]
    fn confirmation_round_trip() {
        let msg = Message::SubscriptionConfirmation(Confirmation {
            code: ResponseCode::Granted,
            requested_key_blob: CubeKey::from_bytes([3; 32]),
            cubes_hash_blob: CubeKey::ZERO,
            duration_ms: 30_000,
        });

        match round_trip(&msg) {
            Message::SubscriptionConfirmation(conf) => {
                assert_eq!(conf.code, ResponseCode::Granted);
                assert_eq!(conf.requested_key_blob, CubeKey::from_bytes([3; 32]));
                assert!(conf.cubes_hash_blob.is_zero());
                assert_eq!(conf.duration_ms, 30_000);
            }
            other => panic!("wrong class: {other:?}"),
        }
    }

    #[test]
    fn batch_limits_are_caller_errors() {
        let keys: KeyBatch = (0..=MAX_KEYS_PER_MESSAGE)
            .map(|i| CubeKey::from_bytes([i as u8; 32]))
            .collect();
        assert!(matches!(
            Message::CubeRequest { keys }.encode(),
            Err(WireError::BatchTooLarge { .. })
        ));

        let empty = Message::CubeRequest {
            keys: KeyBatch::new(),
        };
        assert!(empty.encode().is_err());
    }

    #[test]
    fn key_blob_single_vs_many() {
        let a = CubeKey::from_bytes([1; 32]);
        let b = CubeKey::from_bytes([2; 32]);

        assert_eq!(key_blob(&[a]), a);

        let many = key_blob(&[a, b]);
        assert_ne!(many, a);
        assert_ne!(many, b);
        // Deterministic
        assert_eq!(many, key_blob(&[a, b]));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let raw = encode_frame(0x7E, b"");
        let mut decoder = FrameDecoder::new();
        decoder.push(&raw);
        let frame = decoder.decode().unwrap().unwrap();
        assert!(matches!(
            Message::decode(&frame),
            Err(WireError::UnknownTag(0x7E))
        ));
    }
}
