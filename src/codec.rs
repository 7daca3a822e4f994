//! DAP wire codec (C1): `Content-Length` framing over a JSON body.
//!
//! Grounded on `perl-dap/src/protocol.rs`'s framing doc comment and
//! `godzie44-BugStalker`'s `dap::transport` header-scanning loop, rewritten
//! as a stateful byte-buffer decoder so it can sit on top of any
//! `AsyncRead` rather than assuming a blocking `BufRead`.

use crate::error::TransportError;
use serde_json::Value;

/// Serializes one DAP message as a framed `Content-Length` chunk.
pub fn encode(message: &Value) -> Result<Vec<u8>, TransportError> {
    let body = serde_json::to_vec(message)?;
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incrementally decodes DAP messages out of a growing byte buffer.
///
/// Callers append newly-read bytes with [`Decoder::feed`] and drain
/// complete messages with [`Decoder::next_message`]. Leading blank lines
/// between messages are tolerated; anything malformed inside a header, a
/// non-numeric or negative `Content-Length`, or a stream that closes before
/// the declared body length is received, is a stream-fatal error (§4.1).
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

enum HeaderScan {
    /// Not enough bytes buffered yet to know.
    Incomplete,
    /// Header block ended cleanly; holds the declared content length and
    /// the offset where the body starts.
    Ready { content_length: usize, body_start: usize },
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete message if one is buffered, else `None`.
    /// Does not block; callers poll this after every `feed`.
    pub fn next_message(&mut self) -> Result<Option<Value>, TransportError> {
        loop {
            match self.scan_headers()? {
                HeaderScan::Incomplete => return Ok(None),
                HeaderScan::Ready { content_length, body_start } => {
                    if self.buf.len() < body_start + content_length {
                        return Ok(None);
                    }
                    let body = &self.buf[body_start..body_start + content_length];
                    let value: Value = serde_json::from_slice(body)?;
                    self.buf.drain(0..body_start + content_length);
                    return Ok(Some(value));
                }
            }
        }
    }

    fn scan_headers(&mut self) -> Result<HeaderScan, TransportError> {
        // Tolerate stray blank lines before a header block (but never
        // inside one).
        let mut start = 0;
        while self.buf[start..].starts_with(b"\r\n") {
            start += 2;
        }
        if start > 0 {
            self.buf.drain(0..start);
        }

        let Some(header_end) = find(&self.buf, b"\r\n\r\n") else {
            if self.buf.len() > 8192 && find(&self.buf, b"\n").is_none() {
                return Err(TransportError::MalformedHeader(
                    "header block exceeds 8KiB without terminator".into(),
                ));
            }
            return Ok(HeaderScan::Incomplete);
        };

        let header_block = std::str::from_utf8(&self.buf[..header_end])
            .map_err(|e| TransportError::MalformedHeader(e.to_string()))?;

        let mut content_length = None;
        for line in header_block.split("\r\n") {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(TransportError::MalformedHeader(format!("bad header line: {line:?}")));
            };
            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                let len: i64 = value
                    .parse()
                    .map_err(|_| TransportError::MalformedHeader(format!("non-numeric length: {value:?}")))?;
                if len < 0 {
                    return Err(TransportError::MalformedHeader(format!("negative length: {len}")));
                }
                content_length = Some(len as usize);
            }
        }

        let content_length = content_length
            .ok_or_else(|| TransportError::MalformedHeader("missing Content-Length header".into()))?;
        Ok(HeaderScan::Ready { content_length, body_start: header_end + 4 })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_message() {
        let msg = json!({"seq": 1, "type": "request", "command": "initialize"});
        let framed = encode(&msg).unwrap();
        let mut d = Decoder::new();
        d.feed(&framed);
        let decoded = d.next_message().unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(d.next_message().unwrap().is_none());
    }

    #[test]
    fn decodes_messages_split_across_feeds() {
        let msg = json!({"seq": 2, "type": "event", "event": "stopped"});
        let framed = encode(&msg).unwrap();
        let mut d = Decoder::new();
        let (a, b) = framed.split_at(framed.len() / 2);
        d.feed(a);
        assert!(d.next_message().unwrap().is_none());
        d.feed(b);
        assert_eq!(d.next_message().unwrap().unwrap(), msg);
    }

    #[test]
    fn decodes_two_back_to_back_messages() {
        let m1 = json!({"seq": 1, "type": "request", "command": "a"});
        let m2 = json!({"seq": 2, "type": "request", "command": "b"});
        let mut framed = encode(&m1).unwrap();
        framed.extend(encode(&m2).unwrap());
        let mut d = Decoder::new();
        d.feed(&framed);
        assert_eq!(d.next_message().unwrap().unwrap(), m1);
        assert_eq!(d.next_message().unwrap().unwrap(), m2);
        assert!(d.next_message().unwrap().is_none());
    }

    #[test]
    fn tolerates_leading_blank_lines_between_messages() {
        let m1 = json!({"seq": 1, "type": "event", "event": "x"});
        let mut framed = encode(&m1).unwrap();
        framed.extend_from_slice(b"\r\n\r\n");
        framed.extend(encode(&m1).unwrap());
        let mut d = Decoder::new();
        d.feed(&framed);
        assert_eq!(d.next_message().unwrap().unwrap(), m1);
        assert_eq!(d.next_message().unwrap().unwrap(), m1);
    }

    #[test]
    fn rejects_non_numeric_length() {
        let mut d = Decoder::new();
        d.feed(b"Content-Length: notanumber\r\n\r\n{}");
        assert!(d.next_message().is_err());
    }

    #[test]
    fn rejects_negative_length() {
        let mut d = Decoder::new();
        d.feed(b"Content-Length: -1\r\n\r\n");
        assert!(d.next_message().is_err());
    }
}
