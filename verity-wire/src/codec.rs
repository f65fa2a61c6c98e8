use bytes::{Buf, Bytes, BytesMut};
use std::io;
use thiserror::Error;

/// Current protocol version, first two bytes of every frame body.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Frame header past the length prefix: version (2) + class tag (1).
const FRAME_HEADER: usize = 3;

/// Hard cap on a frame body; generous room for a full cube batch.
const MAX_BODY_LEN: usize = 128 * 1024;

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Protocol violation: frame size too large")]
    SizeTooLarge,

    #[error("Protocol version mismatch: {0:#06x}")]
    VersionMismatch(u16),

    #[error("Unknown message class tag: {0:#04x}")]
    UnknownTag(u8),

    #[error("Malformed message body: {0}")]
    Malformed(&'static str),

    #[error("Batch of {len} exceeds per-message limit {max}")]
    BatchTooLarge { len: usize, max: usize },
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

/// A decoded frame: protocol version, class tag, and the message body.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub tag: u8,
    pub body: Bytes,
}

/// Encode one frame: `[len u32][version u16][tag u8][body]`.
///
/// `len` covers version, tag, and body.
#[must_use]
pub fn encode_frame(tag: u8, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + FRAME_HEADER + body.len());
    out.extend_from_slice(&((FRAME_HEADER + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    out.extend_from_slice(&[tag]);
    out.extend_from_slice(body);
    out.freeze()
}

/// Stateful frame decoder.
///
/// Fast path: the whole frame is buffered → zero-copy slice of the body.
/// Slow path: partial frames accumulate until the length prefix is covered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Feed received bytes.
    pub fn push(&mut self, src: &[u8]) {
        self.buf.extend_from_slice(src);
    }

    /// Decode a single frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` → frame decoded
    /// - `Ok(None)` → need more data
    /// - `Err` → protocol violation; the caller decides whether to tear down
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let frame_len =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if frame_len < FRAME_HEADER || frame_len > FRAME_HEADER + MAX_BODY_LEN {
            return Err(WireError::SizeTooLarge);
        }

        if self.buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.buf.advance(4);
        let version = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let tag = self.buf[2];
        self.buf.advance(FRAME_HEADER);
        let body = self.buf.split_to(frame_len - FRAME_HEADER).freeze();

        if version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch(version));
        }

        Ok(Some(Frame { version, tag, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(0x05, b"hello");

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);

        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.tag, 0x05);
        assert_eq!(decoded.body.as_ref(), b"hello");
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn fragmented_frame_reassembles() {
        let frame = encode_frame(0x02, &[0xAB; 300]);

        let mut decoder = FrameDecoder::new();
        for chunk in frame.chunks(7) {
            decoder.push(chunk);
        }

        let decoded = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.body.len(), 300);
    }

    #[test]
    fn back_to_back_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(0x01, b"a"));
        stream.extend_from_slice(&encode_frame(0x02, b"bb"));

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);

        assert_eq!(decoder.decode().unwrap().unwrap().tag, 0x01);
        assert_eq!(decoder.decode().unwrap().unwrap().body.len(), 2);
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&(u32::MAX).to_be_bytes());
        decoder.push(&[0u8; 16]);
        assert!(matches!(decoder.decode(), Err(WireError::SizeTooLarge)));
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&(3u32).to_be_bytes());
        raw.extend_from_slice(&0x7777u16.to_be_bytes());
        raw.extend_from_slice(&[0x01]);

        let mut decoder = FrameDecoder::new();
        decoder.push(&raw);
        assert!(matches!(
            decoder.decode(),
            Err(WireError::VersionMismatch(0x7777))
        ));
    }
}
