//! Newline-delimited JSON framing.
//!
//! Splits a TCP byte stream on `\n`, parses each line as a JSON frame, and
//! serializes outgoing frames with `\n` termination. A frame is never
//! assumed to arrive in one read: partial lines stay buffered.
//!
//! Decoding yields `Result<D>` items so that a malformed line surfaces as a
//! droppable item instead of terminating the stream. Only an over-long line
//! is a codec error.

use super::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// A tokio codec framing `D` values as JSON lines.
#[derive(Debug)]
pub struct FrameCodec<D> {
    _frame: PhantomData<fn() -> D>,
}

impl<D> FrameCodec<D> {
    /// Create a codec.
    pub fn new() -> Self {
        Self {
            _frame: PhantomData,
        }
    }
}

impl<D> Default for FrameCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for FrameCodec<D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

fn oversized() -> Error {
    Error::Protocol(format!("frame exceeds {} bytes", MAX_FRAME_SIZE))
}

/// Parse one line (without its terminator) into a frame.
pub fn parse_line<D: DeserializeOwned>(line: &[u8]) -> Result<D> {
    let text = std::str::from_utf8(line)
        .map_err(|e| Error::Protocol(format!("frame is not UTF-8: {}", e)))?;
    serde_json::from_str(text).map_err(Error::from)
}

impl<D: DeserializeOwned> Decoder for FrameCodec<D> {
    type Item = Result<D>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_FRAME_SIZE {
                    return Err(oversized());
                }
                return Ok(None);
            };
            if pos > MAX_FRAME_SIZE {
                return Err(oversized());
            }

            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(parse_line(&line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                // Unterminated trailing bytes are discarded.
                src.clear();
                Ok(None)
            }
        }
    }
}

impl<D, T: Serialize> Encoder<T> for FrameCodec<D> {
    type Error = Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(oversized());
        }
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, Request, ServerFrame};

    type RequestCodec = FrameCodec<Envelope<Request>>;

    #[test]
    fn decode_waits_for_newline() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::from(&br#"{"type":"GET_"#[..]);
        assert!(codec.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(b"USERS\"}\n");
        let frame = codec
            .decode(&mut buf)
            .expect("decode")
            .expect("complete frame")
            .expect("valid frame");
        assert_eq!(frame.body, Request::GetUsers);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_multiple_frames_in_one_read() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"type\":\"GET_USERS\",\"id\":1}\r\n\n{\"type\":\"GET_USERS\",\"id\":2}\n"[..],
        );

        let first = codec.decode(&mut buf).expect("decode").expect("frame").expect("valid");
        let second = codec.decode(&mut buf).expect("decode").expect("frame").expect("valid");
        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
        assert!(codec.decode(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn malformed_line_is_an_item_not_an_error() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::from(&b"not json\n{\"type\":\"GET_USERS\"}\n"[..]);

        let bad = codec.decode(&mut buf).expect("stream survives").expect("item");
        let err = bad.expect_err("malformed");
        assert!(err.should_silent_drop());

        let good = codec.decode(&mut buf).expect("decode").expect("item").expect("valid");
        assert_eq!(good.body, Request::GetUsers);
    }

    #[test]
    fn overlong_line_is_fatal() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_FRAME_SIZE + 1].as_slice());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn overlong_line_with_terminator_is_fatal() {
        let mut codec = RequestCodec::new();
        let mut line = vec![b'a'; MAX_FRAME_SIZE + 10];
        line.push(b'\n');
        let mut buf = BytesMut::from(line.as_slice());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn line_at_the_limit_is_accepted() {
        let mut codec = RequestCodec::new();
        let head = br#"{"type":"GET_USERS","pad":""#;
        let tail = br#""}"#;
        let mut line = head.to_vec();
        line.resize(MAX_FRAME_SIZE - tail.len(), b'x');
        line.extend_from_slice(tail);
        line.push(b'\n');

        let mut buf = BytesMut::from(line.as_slice());
        let frame = codec.decode(&mut buf).expect("within limit").expect("item").expect("valid");
        assert_eq!(frame.body, Request::GetUsers);
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = FrameCodec::<Envelope<ServerFrame>>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Envelope::bare(ServerFrame::UserList {
                    users: vec!["alice".into()],
                }),
                &mut buf,
            )
            .expect("encode");
        assert_eq!(&buf[..], b"{\"type\":\"USER_LIST\",\"users\":[\"alice\"]}\n");
    }

    #[test]
    fn decode_eof_discards_partial_line() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::from(&br#"{"type":"GET"#[..]);
        assert!(codec.decode_eof(&mut buf).expect("eof").is_none());
        assert!(buf.is_empty());
    }
}
