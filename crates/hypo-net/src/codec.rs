//! Byte-level framing of sync envelopes.
//!
//! Each frame is a 4-byte big-endian length followed by the UTF-8 JSON body
//! of one envelope. The codec is stateless apart from oversize skipping; a
//! framed stream reader buffers until one complete frame is available and
//! hands it off atomically.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use hypo_core::envelope::SyncEnvelope;
use hypo_core::error::CodecError;

/// Default upper bound on one frame's JSON body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Length-prefix size in bytes.
const HEADER_LEN: usize = 4;

#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    /// Bytes of an oversize frame still to be discarded, so one bad frame
    /// does not break stream alignment.
    skip_remaining: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            skip_remaining: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Encoder<SyncEnvelope> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, envelope: SyncEnvelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = serde_json::to_vec(&envelope)?;
        if body.len() > self.max_frame_bytes {
            return Err(CodecError::TooLarge {
                len: body.len(),
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = SyncEnvelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SyncEnvelope>, CodecError> {
        // Finish discarding a previously rejected oversize frame.
        if self.skip_remaining > 0 {
            let discard = self.skip_remaining.min(src.len());
            src.advance(discard);
            self.skip_remaining -= discard;
            if self.skip_remaining > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_bytes {
            // Consume the header and arrange to skip the body as it arrives.
            src.advance(HEADER_LEN);
            let discard = len.min(src.len());
            src.advance(discard);
            self.skip_remaining = len - discard;
            return Err(CodecError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SyncEnvelope>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.skip_remaining == 0 => Ok(None),
            None => Err(CodecError::Truncated),
        }
    }
}

/// Encode one envelope into a standalone frame (used where each WebSocket
/// binary message carries exactly one frame).
pub fn encode_frame(
    envelope: &SyncEnvelope,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > max_frame_bytes {
        return Err(CodecError::TooLarge {
            len: body.len(),
            max: max_frame_bytes,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one standalone frame. Fails with `Truncated` when the buffer holds
/// fewer bytes than the header promises.
pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<SyncEnvelope, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated);
    }

    let len = u32::from_be_bytes(bytes[..HEADER_LEN].try_into().expect("header")) as usize;
    if len > max_frame_bytes {
        return Err(CodecError::TooLarge {
            len,
            max: max_frame_bytes,
        });
    }
    if bytes.len() < HEADER_LEN + len {
        return Err(CodecError::Truncated);
    }

    Ok(serde_json::from_slice(&bytes[HEADER_LEN..HEADER_LEN + len])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypo_core::envelope::{ContentType, EncryptionMeta, EnvelopeKind, Payload};
    use hypo_core::ids::DeviceId;

    fn envelope() -> SyncEnvelope {
        SyncEnvelope::new(
            EnvelopeKind::Clipboard,
            Payload {
                content_type: ContentType::Text,
                ciphertext: vec![0x01, 0x02, 0x03],
                device_id: DeviceId::new("mac"),
                target: Some(DeviceId::new("android")),
                encryption: Some(EncryptionMeta {
                    nonce: vec![0x02],
                    tag: vec![0x03],
                }),
                metadata: None,
            },
        )
    }

    #[test]
    fn test_header_is_big_endian_body_length() {
        let e = envelope();
        let frame = encode_frame(&e, DEFAULT_MAX_FRAME_BYTES).unwrap();
        let body_len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, frame.len() - 4);
        assert_eq!(
            body_len,
            serde_json::to_vec(&e).unwrap().len(),
            "prefix equals the JSON body length"
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let e = envelope();
        let frame = encode_frame(&e, DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).unwrap(), e);
    }

    #[test]
    fn test_every_truncation_fails_truncated() {
        let frame = encode_frame(&envelope(), DEFAULT_MAX_FRAME_BYTES).unwrap();
        for cut in 0..frame.len() {
            match decode_frame(&frame[..cut], DEFAULT_MAX_FRAME_BYTES) {
                Err(CodecError::Truncated) => {}
                other => panic!("truncation at {cut} gave {other:?}"),
            }
        }
    }

    #[test]
    fn test_oversize_encode_rejected() {
        let mut e = envelope();
        e.payload.ciphertext = vec![0u8; DEFAULT_MAX_FRAME_BYTES];
        assert!(matches!(
            encode_frame(&e, DEFAULT_MAX_FRAME_BYTES),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(b"{{{{");
        assert!(matches!(
            decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_envelope_fields_are_malformed() {
        let body = br#"{"id":"x","type":"clipboard","payload":{"content_type":"text","ciphertext":"","device_id":"a","target":null,"encryption":null},"created_at":"2024-01-01T00:00:00Z","extra":true}"#;
        let mut frame = Vec::new();
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        assert!(matches!(
            decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_streaming_decoder_waits_for_full_frame() {
        let e = envelope();
        let frame = encode_frame(&e, DEFAULT_MAX_FRAME_BYTES).unwrap();

        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Partial input does not advance the stream.
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&frame[5..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(e));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversize_frame_keeps_stream_alignment() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();

        // A frame claiming 64 bytes, followed by a valid small frame.
        buf.put_u32(64);
        buf.put_slice(&[0u8; 64]);
        let good = SyncEnvelope::new(
            EnvelopeKind::Control,
            Payload {
                content_type: ContentType::Text,
                ciphertext: vec![],
                device_id: DeviceId::new("a"),
                target: None,
                encryption: None,
                metadata: None,
            },
        );
        let mut small_codec = FrameCodec::new(DEFAULT_MAX_FRAME_BYTES);
        small_codec.encode(good.clone(), &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { len: 64, .. })
        ));
        // The next decode picks up the following frame cleanly.
        codec.max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(good));
    }

    #[test]
    fn test_decode_eof_with_partial_frame_is_truncated() {
        let frame = encode_frame(&envelope(), DEFAULT_MAX_FRAME_BYTES).unwrap();
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::Truncated)
        ));
    }
}
