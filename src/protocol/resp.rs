// src/protocol/resp.rs

//! The minimal RESP2 subset needed to speak to a Redis-compatible peer as a
//! client and to decode a replica command stream. This deliberately stops at
//! RESP2: the engine never negotiates RESP3 (`HELLO 3`), so there is no Map,
//! Set, Boolean or Double variant to support.

use crate::errors::ReplError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// A single frame in the RESP2 protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    Array(Vec<RespFrame>),
    NullArray,
}

impl RespFrame {
    /// Builds a multi-bulk command array out of byte-like arguments, the
    /// shape every outbound request to a Redis-compatible peer takes.
    pub fn command<I, A>(args: I) -> RespFrame
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        RespFrame::Array(
            args.into_iter()
                .map(|a| RespFrame::BulkString(a.into()))
                .collect(),
        )
    }

    /// Encodes this frame into a freshly allocated byte vector. Used by the
    /// replication offset accounting, which needs the exact wire length of a
    /// single decoded command (see the offset-accounting decision in DESIGN.md).
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, ReplError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Interprets this frame as a decoded command's argv, if it is a
    /// multi-bulk array of bulk strings (the only shape expected after the
    /// RDB boundary of a replication stream).
    pub fn into_argv(self) -> Option<Vec<Bytes>> {
        match self {
            RespFrame::Array(items) => items
                .into_iter()
                .map(|f| match f {
                    RespFrame::BulkString(b) => Some(b),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn as_bulk_string(&self) -> Option<&Bytes> {
        match self {
            RespFrame::BulkString(b) => Some(b),
            _ => None,
        }
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding [`RespFrame`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = ReplError;

    fn encode(&mut self, frame: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&frame, dst);
        Ok(())
    }
}

fn encode_frame(frame: &RespFrame, dst: &mut BytesMut) {
    match frame {
        RespFrame::SimpleString(s) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(s.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Error(s) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(s.as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Integer(i) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(i.to_string().as_bytes());
            dst.extend_from_slice(CRLF);
        }
        RespFrame::BulkString(b) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(b.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            dst.extend_from_slice(b);
            dst.extend_from_slice(CRLF);
        }
        RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
        RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
        RespFrame::Array(items) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(items.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            for item in items {
                encode_frame(item, dst);
            }
        }
    }
}

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = ReplError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = 0;
        let frame = parse_frame(src, &mut cursor)?;
        match frame {
            Some(f) => {
                src.advance(cursor);
                Ok(Some(f))
            }
            None => Ok(None),
        }
    }
}

/// Finds the index just past the next CRLF starting at `from`, without
/// consuming anything from `buf` — the caller decides whether to advance.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == CRLF)
        .map(|i| from + i)
}

/// Parses one frame starting at `buf[*cursor..]`. On success, advances
/// `*cursor` past the consumed bytes and returns `Some`. On insufficient
/// data, leaves `*cursor` untouched and returns `None` — the caller never
/// mutates the shared buffer on a partial read.
fn parse_frame(buf: &[u8], cursor: &mut usize) -> Result<Option<RespFrame>, ReplError> {
    if *cursor >= buf.len() {
        return Ok(None);
    }
    let prefix = buf[*cursor];
    let line_start = *cursor + 1;
    match prefix {
        b'+' | b'-' | b':' => {
            let Some(crlf) = find_crlf(buf, line_start) else {
                return Ok(None);
            };
            let line = std::str::from_utf8(&buf[line_start..crlf])
                .map_err(|e| ReplError::Protocol(format!("non-utf8 line: {e}")))?
                .to_string();
            *cursor = crlf + 2;
            Ok(Some(match prefix {
                b'+' => RespFrame::SimpleString(line),
                b'-' => RespFrame::Error(line),
                b':' => RespFrame::Integer(
                    line.parse()
                        .map_err(|_| ReplError::Protocol(format!("bad integer: {line}")))?,
                ),
                _ => unreachable!(),
            }))
        }
        b'$' => {
            let Some(crlf) = find_crlf(buf, line_start) else {
                return Ok(None);
            };
            let len_str = std::str::from_utf8(&buf[line_start..crlf])
                .map_err(|e| ReplError::Protocol(format!("non-utf8 length: {e}")))?;
            let len: i64 = len_str
                .parse()
                .map_err(|_| ReplError::Protocol(format!("bad bulk length: {len_str}")))?;
            if len < 0 {
                *cursor = crlf + 2;
                return Ok(Some(RespFrame::Null));
            }
            let len = len as usize;
            let body_start = crlf + 2;
            let body_end = body_start + len;
            if buf.len() < body_end + 2 {
                return Ok(None);
            }
            let payload = Bytes::copy_from_slice(&buf[body_start..body_end]);
            *cursor = body_end + 2;
            Ok(Some(RespFrame::BulkString(payload)))
        }
        b'*' => {
            let Some(crlf) = find_crlf(buf, line_start) else {
                return Ok(None);
            };
            let len_str = std::str::from_utf8(&buf[line_start..crlf])
                .map_err(|e| ReplError::Protocol(format!("non-utf8 count: {e}")))?;
            let count: i64 = len_str
                .parse()
                .map_err(|_| ReplError::Protocol(format!("bad array count: {len_str}")))?;
            if count < 0 {
                *cursor = crlf + 2;
                return Ok(Some(RespFrame::NullArray));
            }
            let mut probe = crlf + 2;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_frame(buf, &mut probe)? {
                    Some(item) => items.push(item),
                    None => return Ok(None),
                }
            }
            *cursor = probe;
            Ok(Some(RespFrame::Array(items)))
        }
        other => Err(ReplError::Protocol(format!(
            "unexpected RESP prefix byte: {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<RespFrame> {
        let mut buf = BytesMut::from(bytes);
        let mut codec = RespFrameCodec;
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn decodes_simple_string() {
        let frames = decode_all(b"+OK\r\n");
        assert_eq!(frames, vec![RespFrame::SimpleString("OK".into())]);
    }

    #[test]
    fn decodes_command_array() {
        let frames = decode_all(b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n");
        assert_eq!(
            frames,
            vec![RespFrame::Array(vec![
                RespFrame::BulkString("GET".into()),
                RespFrame::BulkString("x".into()),
            ])]
        );
    }

    #[test]
    fn incomplete_frame_returns_none_without_consuming() {
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$1\r\n"[..]);
        let mut codec = RespFrameCodec;
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Nothing was consumed: the buffer is untouched for the next recv().
        assert_eq!(&buf[..], &b"*2\r\n$3\r\nGET\r\n$1\r\n"[..]);
    }

    #[test]
    fn tolerates_byte_by_byte_chunking() {
        let whole = b"*1\r\n$4\r\nPING\r\n";
        let mut buf = BytesMut::new();
        let mut codec = RespFrameCodec;
        let mut result = None;
        for &b in whole {
            buf.extend_from_slice(&[b]);
            if let Some(f) = codec.decode(&mut buf).unwrap() {
                result = Some(f);
            }
        }
        assert_eq!(
            result,
            Some(RespFrame::Array(vec![RespFrame::BulkString(
                "PING".into()
            )]))
        );
    }

    #[test]
    fn null_bulk_string_decodes_to_null() {
        let frames = decode_all(b"$-1\r\n");
        assert_eq!(frames, vec![RespFrame::Null]);
    }

    #[test]
    fn malformed_prefix_is_an_error() {
        let mut buf = BytesMut::from(&b"!bad\r\n"[..]);
        let mut codec = RespFrameCodec;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_then_decode_offset_matches_wire_length() {
        let frame = RespFrame::command(["SET", "x", "1"]);
        let encoded = frame.encode_to_vec().unwrap();
        assert_eq!(encoded.len(), "*3\r\n$3\r\nSET\r\n$1\r\nx\r\n$1\r\n1\r\n".len());
    }
}
