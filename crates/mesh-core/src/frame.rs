//! Line-delimited JSON framing codec (§4.1).
//!
//! Each direction is a stream of UTF-8 lines terminated by `\n`. The codec
//! enforces the 8192-byte cap (including the terminator) before any
//! allocation for the line's contents, and re-assembles lines across
//! arbitrary TCP read boundaries the way `tokio_util::codec::Framed` does
//! for any other line-oriented protocol.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::MAX_FRAME_BYTES;
use crate::error::FrameError;

/// Decodes/encodes raw UTF-8 lines, deferring JSON parsing to the caller so
/// framing errors and envelope-schema errors stay distinguishable.
#[derive(Debug, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = String;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, FrameError> {
        let Some(newline_pos) = buf.iter().position(|b| *b == b'\n') else {
            // No full line yet. Enforce the cap before buffering further so
            // an oversize frame fails fast instead of growing unbounded.
            if buf.len() > MAX_FRAME_BYTES {
                let actual = buf.len();
                buf.clear();
                return Err(FrameError::TooLong {
                    max: MAX_FRAME_BYTES,
                    actual,
                });
            }
            return Ok(None);
        };

        let line_len = newline_pos + 1;
        if line_len > MAX_FRAME_BYTES {
            buf.advance(line_len);
            return Err(FrameError::TooLong {
                max: MAX_FRAME_BYTES,
                actual: line_len,
            });
        }

        let mut line = buf.split_to(line_len);
        line.truncate(line.len() - 1); // drop '\n'
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        let text = String::from_utf8(line.to_vec()).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(Some(text))
    }
}

impl Encoder<String> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), FrameError> {
        if line.len() + 1 > MAX_FRAME_BYTES {
            return Err(FrameError::TooLong {
                max: MAX_FRAME_BYTES,
                actual: line.len() + 1,
            });
        }
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_single_complete_line() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from("hello\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("hello".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn reassembles_a_line_split_across_reads() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from("hel");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn frame_of_exactly_max_bytes_is_accepted() {
        let mut codec = EnvelopeCodec;
        let payload = "a".repeat(MAX_FRAME_BYTES - 1);
        let mut buf = BytesMut::from(format!("{payload}\n").as_bytes());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_BYTES - 1);
    }

    #[test]
    fn frame_one_byte_over_max_is_rejected() {
        let mut codec = EnvelopeCodec;
        let payload = "a".repeat(MAX_FRAME_BYTES);
        let mut buf = BytesMut::from(format!("{payload}\n").as_bytes());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TooLong { .. }));
    }

    #[test]
    fn oversize_data_without_newline_yet_is_rejected_before_buffering_more() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from(vec![b'a'; MAX_FRAME_BYTES + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TooLong { .. }));
    }

    #[test]
    fn multiple_lines_in_one_buffer_decode_in_order() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::from("one\ntwo\nthree\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("one".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("two".to_string()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("three".to_string()));
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = EnvelopeCodec;
        let mut buf = BytesMut::new();
        codec.encode("hello".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"hello\n");
    }
}
