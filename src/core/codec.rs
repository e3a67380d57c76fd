//! # Relay Framings
//!
//! A relay carries packets as opaque messages; how the JSON body sits inside a
//! message depends on the relay.
//!
//! - [`Framing::Fenced`] wraps the body in a fenced json code block, which is
//!   how packets are posted to chat channels:
//!   ```text
//!   ```json
//!   {"op":3,...}```
//!   ```
//! - [`Framing::Line`] terminates the body with a newline for stream sockets.
//!
//! [`LineCodec`] is the `tokio_util` codec used to split a byte stream into
//! line frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{constants, ProtocolError, Result};

const FENCE_OPEN: &[u8] = b"```json\n";
const FENCE_CLOSE: &[u8] = b"```";

/// How a packet body is embedded in a relay message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Fenced json code block (chat relays)
    #[default]
    Fenced,
    /// Newline terminated (stream sockets)
    Line,
}

impl Framing {
    /// Embed a packet body into a relay message.
    pub fn wrap(self, body: &[u8]) -> Bytes {
        match self {
            Framing::Fenced => {
                let mut out =
                    BytesMut::with_capacity(FENCE_OPEN.len() + body.len() + FENCE_CLOSE.len());
                out.put_slice(FENCE_OPEN);
                out.put_slice(body);
                out.put_slice(FENCE_CLOSE);
                out.freeze()
            }
            Framing::Line => {
                let mut out = BytesMut::with_capacity(body.len() + 1);
                out.put_slice(body);
                out.put_u8(b'\n');
                out.freeze()
            }
        }
    }

    /// Extract the packet body from a relay message.
    pub fn unwrap(self, message: &[u8]) -> Result<&[u8]> {
        match self {
            Framing::Fenced => message
                .strip_prefix(FENCE_OPEN)
                .and_then(|rest| rest.strip_suffix(FENCE_CLOSE))
                .ok_or_else(|| ProtocolError::InvalidPacket(constants::ERR_MISSING_FENCE.into())),
            Framing::Line => Ok(trim_line_ending(message)),
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Newline delimited frame codec.
///
/// Empty lines are skipped. A line longer than `max_length` without a
/// terminator is an [`ProtocolError::OversizedPacket`].
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let found = src[self.next_index..].iter().position(|b| *b == b'\n');

            let Some(offset) = found else {
                if src.len() > self.max_length {
                    return Err(ProtocolError::OversizedPacket(src.len()));
                }
                // Resume the scan where we stopped once more bytes arrive
                self.next_index = src.len();
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;

            if end > self.max_length {
                return Err(ProtocolError::OversizedPacket(end));
            }

            let frame = src.split_to(end + 1);
            let line = trim_line_ending(&frame);
            if line.is_empty() {
                continue;
            }
            let len = line.len();
            let mut frame = frame.freeze();
            frame.truncate(len);
            return Ok(Some(frame));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        // Trailing bytes without a newline still form a frame at end of stream
        let rest = src.split_to(src.len()).freeze();
        Ok((!rest.is_empty()).then_some(rest))
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<()> {
        if body.len() > self.max_length {
            return Err(ProtocolError::OversizedPacket(body.len()));
        }
        if body.contains(&b'\n') {
            return Err(ProtocolError::InvalidPacket(
                "line frames cannot contain a newline".into(),
            ));
        }
        dst.reserve(body.len() + 1);
        dst.put(body.chunk());
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_wrap_and_unwrap() {
        let message = Framing::Fenced.wrap(br#"{"op":0}"#);
        assert_eq!(&message[..], b"```json\n{\"op\":0}```");
        assert_eq!(Framing::Fenced.unwrap(&message).unwrap(), br#"{"op":0}"#);
    }

    #[test]
    fn test_fenced_rejects_plain_text() {
        let result = Framing::Fenced.unwrap(b"hello there");
        assert!(matches!(result, Err(ProtocolError::InvalidPacket(_))));
    }

    #[test]
    fn test_line_unwrap_strips_crlf() {
        assert_eq!(Framing::Line.unwrap(b"abc\r\n").unwrap(), b"abc");
        assert_eq!(Framing::Line.unwrap(b"abc").unwrap(), b"abc");
    }

    #[test]
    fn test_partial_line_waits_for_more() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"op\":"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(b"3}\n");
        let frame = codec.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(&frame[..], b"{\"op\":3}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_lines_and_blank_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"one\n\n\r\ntwo\r\n"[..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_line_is_rejected() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::OversizedPacket(10))
        ));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"abc\n");
        assert!(codec
            .encode(Bytes::from_static(b"a\nb"), &mut buf)
            .is_err());
    }

    #[test]
    fn test_eof_flushes_unterminated_frame() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"tail"[..]);
        assert_eq!(&codec.decode_eof(&mut buf).unwrap().unwrap()[..], b"tail");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
