//! Tokio codec for the framed broker stream

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// A complete frame: a message type and its raw payload
#[derive(Debug, Clone)]
pub struct Frame {
    /// Type byte of the message
    pub msg_type: MessageType,
    /// Raw payload; fixed fields are sliced by the handlers
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(msg_type: MessageType, payload: Bytes) -> Self {
        Self { msg_type, payload }
    }
}

/// Encode one frame from scattered payload parts into `dst`.
///
/// This is the single outbound encoding path; callers assemble payloads
/// as slices (sid, subtype, data, ...) and avoid intermediate copies.
pub fn encode_frame_parts(
    dst: &mut BytesMut,
    msg_type: MessageType,
    parts: &[&[u8]],
) -> Result<(), ProtocolError> {
    let len: usize = parts.iter().map(|p| p.len()).sum();

    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    dst.reserve(HEADER_SIZE + len);
    dst.put_u8(msg_type.as_u8());
    dst.put_u16(len as u16);
    for part in parts {
        dst.extend_from_slice(part);
    }

    Ok(())
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate the header without consuming it, so a partial payload
        // leaves the buffer untouched until the rest arrives.
        let msg_type = MessageType::from_u8(src[0])
            .ok_or(ProtocolError::UnknownMessageType(src[0]))?;
        let payload_len = u16::from_be_bytes([src[1], src[2]]) as usize;

        let min = msg_type.min_payload_len();
        if payload_len < min {
            return Err(ProtocolError::ShortPayload {
                name: msg_type.name(),
                min,
                got: payload_len,
            });
        }

        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame { msg_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame_parts(dst, frame.msg_type, &[&frame.payload])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg_type: MessageType, payload: &[u8]) -> Frame {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(msg_type, Bytes::copy_from_slice(payload)), &mut buf)
            .unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_codec_roundtrip() {
        let decoded = roundtrip(MessageType::Cmd, b"hello");
        assert_eq!(decoded.msg_type, MessageType::Cmd);
        assert_eq!(decoded.payload.as_ref(), b"hello");
    }

    #[test]
    fn test_codec_empty_payload() {
        let decoded = roundtrip(MessageType::Heartbeat, b"");
        assert_eq!(decoded.msg_type, MessageType::Heartbeat);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_codec_max_payload() {
        let payload = vec![0x5a; MAX_PAYLOAD_SIZE];
        let decoded = roundtrip(MessageType::Cmd, &payload);
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_encoder_rejects_oversize() {
        let mut buf = BytesMut::new();
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = encode_frame_parts(&mut buf, MessageType::Cmd, &[&payload]).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encoder_parts_concatenated() {
        let mut buf = BytesMut::new();
        encode_frame_parts(&mut buf, MessageType::TermData, &[&[b'a'; 32], b"xy"]).unwrap();

        assert_eq!(buf[0], MessageType::TermData.as_u8());
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 34);
        assert_eq!(&buf[3..35], &[b'a'; 32]);
        assert_eq!(&buf[35..], b"xy");
    }

    #[test]
    fn test_decoder_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        encode_frame_parts(&mut full, MessageType::Login, &[&[b's'; 32]]).unwrap();

        let mut partial = full.split_to(HEADER_SIZE + 10);
        // Header only, then header + partial payload: both need more data.
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), HEADER_SIZE + 10);

        partial.unsplit(full);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.msg_type, MessageType::Login);
        assert_eq!(frame.payload.len(), 32);
    }

    #[test]
    fn test_decoder_unknown_type() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0xfe, 0x00, 0x00][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageType(0xfe)));
    }

    #[test]
    fn test_decoder_short_payload_per_type() {
        let cases = [
            (MessageType::Register, 0u16),
            (MessageType::Login, 31),
            (MessageType::Logout, 31),
            (MessageType::TermData, 32),
            (MessageType::Winsize, 35),
            (MessageType::File, 32),
            (MessageType::Ack, 33),
            (MessageType::Http, 25),
        ];

        for (typ, declared) in cases {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::new();
            buf.put_u8(typ.as_u8());
            buf.put_u16(declared);
            buf.extend_from_slice(&vec![0u8; declared as usize]);

            let err = codec.decode(&mut buf).unwrap_err();
            match err {
                ProtocolError::ShortPayload { name, got, .. } => {
                    assert_eq!(name, typ.name());
                    assert_eq!(got, declared as usize);
                }
                other => panic!("expected ShortPayload for {typ}, got {other}"),
            }
        }
    }

    #[test]
    fn test_decoder_consecutive_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        encode_frame_parts(&mut buf, MessageType::Heartbeat, &[b""]).unwrap();
        encode_frame_parts(&mut buf, MessageType::Logout, &[&[b'b'; 32]]).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.msg_type, MessageType::Heartbeat);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.msg_type, MessageType::Logout);
        assert!(buf.is_empty());
    }
}
