//! Wire framing for envelopes on a child's standard streams.
//!
//! Two disciplines are supported, chosen per connection:
//! - line-delimited: one JSON document per line
//! - length-prefixed: `Key: value` headers, a blank line, then exactly
//!   `Content-Length` bytes of JSON
//!
//! Decoding drops malformed frames with a warning and resynchronizes on the
//! next frame boundary.

use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Bodies above this size are read and discarded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// How envelopes are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    #[serde(alias = "line")]
    LineDelimited,
    #[serde(alias = "length")]
    LengthPrefixed,
}

impl Framing {
    /// Serialize one envelope into a complete frame.
    pub fn encode(self, envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
        let body = serde_json::to_vec(envelope)?;
        let frame = match self {
            Framing::LineDelimited => {
                let mut out = body;
                out.push(b'\n');
                out
            }
            Framing::LengthPrefixed => {
                let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
                out.extend_from_slice(&body);
                out
            }
        };
        Ok(frame)
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::LineDelimited => f.write_str("line-delimited"),
            Framing::LengthPrefixed => f.write_str("length-prefixed"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" | "line-delimited" => Ok(Framing::LineDelimited),
            "length" | "length-prefixed" => Ok(Framing::LengthPrefixed),
            other => Err(format!("unknown framing '{other}'")),
        }
    }
}

/// Decodes a byte stream into envelopes, one frame at a time.
pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader,
            framing,
            line: Vec::new(),
        }
    }

    /// Next well-formed envelope, or `None` at end of stream.
    ///
    /// Only I/O failures are returned as errors.
    pub async fn next_envelope(&mut self) -> std::io::Result<Option<Envelope>> {
        match self.framing {
            Framing::LineDelimited => self.next_line_frame().await,
            Framing::LengthPrefixed => self.next_length_frame().await,
        }
    }

    async fn read_line(&mut self) -> std::io::Result<bool> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line).await?;
        Ok(n > 0)
    }

    async fn next_line_frame(&mut self) -> std::io::Result<Option<Envelope>> {
        loop {
            if !self.read_line().await? {
                return Ok(None);
            }
            let line = self.line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Envelope>(line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    tracing::warn!(
                        "Dropping malformed frame: {e}: {}",
                        String::from_utf8_lossy(line)
                    );
                }
            }
        }
    }

    async fn next_length_frame(&mut self) -> std::io::Result<Option<Envelope>> {
        loop {
            let Some(content_length) = self.read_headers().await? else {
                return Ok(None);
            };

            let len = match content_length {
                Some(n) if n > 0 => n,
                _ => {
                    tracing::warn!("Dropping frame without Content-Length");
                    continue;
                }
            };

            if len > MAX_FRAME_BYTES {
                tracing::warn!("Discarding oversized frame ({len} bytes)");
                let mut limited = (&mut self.reader).take(len as u64);
                let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
                if skipped < len as u64 {
                    return Ok(None);
                }
                continue;
            }

            let mut body = vec![0u8; len];
            match self.reader.read_exact(&mut body).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }

            match serde_json::from_slice::<Envelope>(&body) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => tracing::warn!("Dropping malformed frame body: {e}"),
            }
        }
    }

    /// Read one header block. Outer `None` is end of stream; inner `None`
    /// means the block carried no usable `Content-Length`.
    async fn read_headers(&mut self) -> std::io::Result<Option<Option<usize>>> {
        let mut content_length = None;
        let mut saw_header = false;
        loop {
            if !self.read_line().await? {
                return Ok(None);
            }
            let line = self.line.trim_ascii();
            if line.is_empty() {
                if saw_header {
                    return Ok(Some(content_length));
                }
                continue;
            }
            saw_header = true;

            let text = String::from_utf8_lossy(line);
            match text.split_once(':') {
                Some((key, value)) if key.trim().eq_ignore_ascii_case("content-length") => {
                    content_length = value.trim().parse::<usize>().ok();
                    if content_length.is_none() {
                        tracing::warn!("Invalid Content-Length header: {text}");
                    }
                }
                Some(_) => {}
                None => tracing::warn!("Ignoring malformed header line: {text}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{RequestId, RpcError};

    async fn decode_all(bytes: &[u8], framing: Framing) -> Vec<Envelope> {
        let mut reader = FrameReader::new(bytes, framing);
        let mut out = Vec::new();
        while let Some(env) = reader.next_envelope().await.unwrap() {
            out.push(env);
        }
        out
    }

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::request(
                RequestId::Number(1),
                "tools/call",
                Some(serde_json::json!({"name": "add", "arguments": {"x": 2, "y": 3}})),
            ),
            Envelope::notification("notifications/initialized", None),
            Envelope::response(
                RequestId::Text("req-2".into()),
                serde_json::json!({"content": [{"type": "text", "text": "line one\nline two"}]}),
            ),
            Envelope::error_response(RequestId::Number(3), RpcError::new(-32601, "nope")),
        ]
    }

    #[tokio::test]
    async fn roundtrip_both_framings() {
        for framing in [Framing::LineDelimited, Framing::LengthPrefixed] {
            let envelopes = sample_envelopes();
            let mut wire = Vec::new();
            for env in &envelopes {
                wire.extend(framing.encode(env).unwrap());
            }
            assert_eq!(decode_all(&wire, framing).await, envelopes, "{framing}");
        }
    }

    #[test]
    fn line_frame_is_single_line() {
        let env = &sample_envelopes()[2];
        let frame = Framing::LineDelimited.encode(env).unwrap();
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(frame.last(), Some(&b'\n'));
    }

    #[test]
    fn length_frame_header_matches_body() {
        let env = Envelope::notification("ping", None);
        let frame = Framing::LengthPrefixed.encode(&env).unwrap();
        let text = String::from_utf8(frame).unwrap();
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        assert_eq!(header, format!("Content-Length: {}", body.len()));
    }

    #[tokio::test]
    async fn line_decoder_skips_malformed_and_blank_lines() {
        let wire = b"not json\n\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n{broken\n{\"jsonrpc\":\"2.0\",\"method\":\"x\"}\n";
        let decoded = decode_all(wire, Framing::LineDelimited).await;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].id, Some(RequestId::Number(1)));
        assert_eq!(decoded[1].method.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn line_decoder_accepts_final_line_without_newline() {
        let wire = b"{\"jsonrpc\":\"2.0\",\"id\":5,\"result\":true}";
        let decoded = decode_all(wire, Framing::LineDelimited).await;
        assert_eq!(decoded.len(), 1);
    }

    #[tokio::test]
    async fn length_decoder_drops_frame_without_content_length() {
        let good = Framing::LengthPrefixed
            .encode(&Envelope::notification("after", None))
            .unwrap();
        let mut wire = b"X-Other: 1\r\n\r\nContent-Length: 0\r\n\r\n".to_vec();
        wire.extend(good);
        let decoded = decode_all(&wire, Framing::LengthPrefixed).await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].method.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn length_decoder_resyncs_after_bad_body_and_garbage_header() {
        let good = Framing::LengthPrefixed
            .encode(&Envelope::notification("ok", None))
            .unwrap();
        let mut wire = b"Content-Length: 4\r\n\r\nnope".to_vec();
        wire.extend(b"garbage without colon\r\ncontent-length: 2\r\n\r\n{}".iter());
        wire.extend(good);
        let decoded = decode_all(&wire, Framing::LengthPrefixed).await;
        // `{}` parses as an envelope with no fields, the bad body is dropped.
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].method.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn length_decoder_ends_on_truncated_body() {
        let wire = b"Content-Length: 100\r\n\r\n{\"jsonrpc\"";
        let decoded = decode_all(wire, Framing::LengthPrefixed).await;
        assert!(decoded.is_empty());
    }

    #[test]
    fn framing_parses_from_str_and_config() {
        assert_eq!("line".parse::<Framing>().unwrap(), Framing::LineDelimited);
        assert_eq!(
            "Length-Prefixed".parse::<Framing>().unwrap(),
            Framing::LengthPrefixed
        );
        assert!("xml".parse::<Framing>().is_err());

        #[derive(Deserialize)]
        struct Holder {
            framing: Framing,
        }
        let h: Holder = toml::from_str("framing = \"length\"").unwrap();
        assert_eq!(h.framing, Framing::LengthPrefixed);
        let h: Holder = toml::from_str("framing = \"line-delimited\"").unwrap();
        assert_eq!(h.framing, Framing::LineDelimited);
    }
}
