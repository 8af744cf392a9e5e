//! Length/type framing for the binary TCP protocols.
//!
//! ```text
//! +----------------+----------------+-------------------+-----------------+
//! | length: u16 LE | type: u16 LE   | payload           | trailer (opt.)  |
//! +----------------+----------------+-------------------+-----------------+
//!   length = 4 + payload.len(), the trailer is not counted
//! ```
//!
//! Decoding is a pure function of the buffer: when not enough bytes have
//! arrived yet, [`FrameCodec::try_extract`] returns `Ok(None)` and leaves the
//! buffer untouched so the caller can read more and try again.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 4;

/// Resync marker appended to game client frames.
pub const GAME_TRAILER: &[u8; 8] = b"MERIDIAN";

/// Upper bound enforced when no tighter limit is configured.
pub const DEFAULT_MAX_FRAME: usize = 8192;

/// One decoded unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_code: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(type_code: u16, payload: impl Into<Bytes>) -> Self {
        Self { type_code, payload: payload.into() }
    }

    pub fn empty(type_code: u16) -> Self {
        Self { type_code, payload: Bytes::new() }
    }
}

/// Frame encoder/decoder for one link.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    trailer: Option<&'static [u8]>,
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(None, DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    /// `max_frame` bounds the declared length (header plus payload); it is
    /// clamped to what a u16 length field can express.
    pub fn new(trailer: Option<&'static [u8]>, max_frame: usize) -> Self {
        Self {
            trailer,
            max_frame: max_frame.clamp(HEADER_LEN, u16::MAX as usize),
        }
    }

    pub fn with_trailer(max_frame: usize) -> Self {
        Self::new(Some(GAME_TRAILER), max_frame)
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn trailer_len(&self) -> usize {
        self.trailer.map_or(0, |t| t.len())
    }

    /// Largest payload that still fits in one frame.
    pub fn max_payload(&self) -> usize {
        self.max_frame - HEADER_LEN
    }

    /// Pulls the next complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer holds only part of a frame.
    pub fn try_extract(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        let type_code = u16::from_le_bytes([buf[2], buf[3]]);

        if length < HEADER_LEN {
            return Err(FrameError::TooShort(length));
        }
        if length > self.max_frame {
            return Err(FrameError::TooLong { length, max: self.max_frame });
        }

        let total = length + self.trailer_len();
        if buf.len() < total {
            return Ok(None);
        }

        if let Some(trailer) = self.trailer {
            if &buf[length..total] != trailer {
                return Err(FrameError::TrailerMismatch { type_code });
            }
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(length - HEADER_LEN).freeze();
        buf.advance(self.trailer_len());

        Ok(Some(Frame { type_code, payload }))
    }

    /// Serializes a frame, appending the trailer when this link uses one.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let length = HEADER_LEN + frame.payload.len();
        if length > self.max_frame {
            return Err(FrameError::PayloadTooLarge(frame.payload.len()));
        }

        dst.reserve(length + self.trailer_len());
        dst.put_u16_le(length as u16);
        dst.put_u16_le(frame.type_code);
        dst.put_slice(&frame.payload);
        if let Some(trailer) = self.trailer {
            dst.put_slice(trailer);
        }
        Ok(())
    }

    pub fn to_bytes(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        let mut out = BytesMut::new();
        self.encode(frame, &mut out)?;
        Ok(out.freeze())
    }
}

/// Renders raw bytes for protocol-fault diagnostics, capped at `limit` bytes.
pub fn hex_preview(data: &[u8], limit: usize) -> String {
    let mut out = String::with_capacity(limit.min(data.len()) * 3);
    for (i, b) in data.iter().take(limit).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    if data.len() > limit {
        out.push_str(&format!(" .. (+{} bytes)", data.len() - limit));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_is_incomplete() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x09u8][..]);
        assert_eq!(codec.try_extract(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let codec = FrameCodec::with_trailer(1024);
        let wire = codec.to_bytes(&Frame::new(1010, &b"jump"[..])).unwrap();

        let mut buf = BytesMut::new();
        for (i, byte) in wire.iter().enumerate() {
            buf.put_u8(*byte);
            let result = codec.try_extract(&mut buf).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "frame surfaced early at byte {i}");
            } else {
                let frame = result.expect("complete frame");
                assert_eq!(frame.type_code, 1010);
                assert_eq!(&frame.payload[..], b"jump");
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(&Frame::new(1, &b"a"[..]), &mut buf).unwrap();
        codec.encode(&Frame::empty(2), &mut buf).unwrap();
        codec.encode(&Frame::new(3, &b"ccc"[..]), &mut buf).unwrap();

        let codes: Vec<u16> = std::iter::from_fn(|| codec.try_extract(&mut buf).unwrap())
            .map(|f| f.type_code)
            .collect();
        assert_eq!(codes, vec![1, 2, 3]);
    }

    #[test]
    fn test_length_below_header_is_fault() {
        let codec = FrameCodec::default();
        let mut buf = BytesMut::from(&[0x02u8, 0x00, 0x01, 0x00][..]);
        assert!(matches!(codec.try_extract(&mut buf), Err(FrameError::TooShort(2))));
    }

    #[test]
    fn test_oversized_frame_is_fault() {
        let codec = FrameCodec::new(None, 64);
        let mut buf = BytesMut::from(&[0x00u8, 0x04, 0x01, 0x00][..]);
        assert!(matches!(
            codec.try_extract(&mut buf),
            Err(FrameError::TooLong { length: 1024, max: 64 })
        ));
        assert!(codec.encode(&Frame::new(1, vec![0u8; 61]), &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_trailer_mismatch_is_fault() {
        let codec = FrameCodec::with_trailer(1024);
        let mut wire = BytesMut::from(&codec.to_bytes(&Frame::new(5, &b"xy"[..])).unwrap()[..]);
        let last = wire.len() - 1;
        wire[last] = b'?';
        assert!(matches!(
            codec.try_extract(&mut wire),
            Err(FrameError::TrailerMismatch { type_code: 5 })
        ));
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0xde, 0xad, 0x01], 8), "de ad 01");
        assert_eq!(hex_preview(&[1, 2, 3, 4], 2), "01 02 .. (+2 bytes)");
    }
}
