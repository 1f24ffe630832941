//! Length-prefixed JSON framing.
//!
//! Each frame is an 8-byte, zero-padded ASCII decimal length followed by
//! that many bytes of UTF-8 JSON:
//!
//! ```text
//! 00000017{"type":"PING"}
//! ```
//!
//! The decoder only splits frames; turning a body into a [`Request`] or
//! [`ServerFrame`] is left to the caller so that a malformed body can be
//! answered without tearing down the connection.
//!
//! [`Request`]: crate::protocol::Request
//! [`ServerFrame`]: crate::protocol::ServerFrame

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, MAX_ENCODABLE_FRAME};
use crate::error::CodecError;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_ENCODABLE_FRAME),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let header = &src[..FRAME_HEADER_LEN];
        if !header.iter().all(u8::is_ascii_digit) {
            return Err(CodecError::InvalidHeader(
                String::from_utf8_lossy(header).into_owned(),
            ));
        }
        let len = header
            .iter()
            .fold(0usize, |acc, d| acc * 10 + usize::from(d - b'0'));

        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let total = FRAME_HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        let body = frame.split_off(FRAME_HEADER_LEN);
        Ok(Some(body.freeze()))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_slice(format!("{:0width$}", body.len(), width = FRAME_HEADER_LEN).as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, ServerFrame};

    #[test]
    fn encodes_zero_padded_header() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(ServerFrame::Pong, &mut buf).unwrap();
        assert_eq!(&buf[..], b"00000015{\"type\":\"PONG\"}");
    }

    #[test]
    fn waits_for_complete_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"00000015{\"type\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"PING\"}00000002{}");
        let body = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Request::decode(&body).unwrap(), Request::Ping);

        // The next frame stays buffered until asked for.
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&next[..], b"{}");
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_non_numeric_header() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidHeader(_))
        ));
    }

    #[test]
    fn rejects_oversized_frame() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&b"00000100"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { size: 100, max: 16 })
        ));
    }
}
