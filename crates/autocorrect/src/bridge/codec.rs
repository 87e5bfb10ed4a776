//! Newline-delimited JSON codec for the suggestion process pipe.
//!
//! Uses LinesCodec for framing + serde_json for serialization, the same
//! delimiter in both directions. Bytes accumulate across reads until a full
//! line is available, so a message split over several chunks or several
//! messages packed into one chunk decode identically.
//!
//! A line that is not valid JSON, or not valid UTF-8, is yielded as
//! `Err(MalformedFrame)` rather than as a stream error: the dispatcher must reject exactly one request for
//! it and keep reading.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Upper bound on a single line, in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

const EXCERPT_LEN: usize = 120;

/// A frame that could not be decoded into a message.
#[derive(Debug, thiserror::Error)]
pub enum MalformedFrame {
    #[error("unparseable frame ({source}): {excerpt:?}")]
    Invalid {
        excerpt: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("frame is not valid UTF-8")]
    Encoding,
    #[error("truncated frame: {excerpt:?}")]
    Truncated { excerpt: String },
    #[error("frame exceeds {max} bytes")]
    Oversized { max: usize },
}

/// Codec that frames messages with a trailing newline and serializes with JSON.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    max_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            max_length,
            _phantom: PhantomData,
        }
    }
}

fn excerpt(line: &str) -> String {
    line.chars().take(EXCERPT_LEN).collect()
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    /// Blank lines carry no message and are skipped.
    fn parse(line: &str) -> Option<Result<T, MalformedFrame>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(serde_json::from_str(trimmed).map_err(|e| {
            if e.is_eof() {
                MalformedFrame::Truncated {
                    excerpt: excerpt(trimmed),
                }
            } else {
                MalformedFrame::Invalid {
                    excerpt: excerpt(trimmed),
                    source: e,
                }
            }
        }))
    }

    fn lift(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Option<Result<T, MalformedFrame>>>, io::Error> {
        match decoded {
            Ok(Some(line)) => Ok(Some(Self::parse(&line))),
            Ok(None) => Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(max = self.max_length, "Discarding oversized frame");
                Ok(Some(Some(Err(MalformedFrame::Oversized {
                    max: self.max_length,
                }))))
            }
            // LinesCodec has already split the line off the buffer.
            Err(LinesCodecError::Io(e)) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(error = %e, "Discarding non UTF-8 frame");
                Ok(Some(Some(Err(MalformedFrame::Encoding))))
            }
            Err(LinesCodecError::Io(e)) => Err(e),
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, MalformedFrame>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.inner.decode(src);
            match self.lift(decoded)? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let decoded = self.inner.decode_eof(src);
            match self.lift(decoded)? {
                Some(Some(item)) => return Ok(Some(item)),
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(json, dst).map_err(|e| match e {
            LinesCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{LookupRequest, LookupResponse, ResponseOutcome};

    fn decode_all(
        codec: &mut JsonLinesCodec<LookupResponse>,
        buf: &mut BytesMut,
    ) -> Vec<Result<LookupResponse, MalformedFrame>> {
        let mut out = Vec::new();
        while let Some(item) = codec.decode(buf).unwrap() {
            out.push(item);
        }
        out
    }

    fn words(item: Result<LookupResponse, MalformedFrame>) -> Vec<String> {
        match item.unwrap().into_outcome() {
            ResponseOutcome::Suggestions(s) => s,
            other => panic!("expected suggestions, got {other:?}"),
        }
    }

    #[test]
    fn encode_appends_newline() {
        let mut codec = JsonLinesCodec::<LookupRequest>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                LookupRequest {
                    id: 1,
                    word: "wrold".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"{\"id\":1,\"word\":\"wrold\"}\n");
    }

    #[test]
    fn encode_escapes_embedded_newlines() {
        let mut codec = JsonLinesCodec::<LookupRequest>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                LookupRequest {
                    id: 2,
                    word: "a\nb".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(buf.last(), Some(&b'\n'));
    }

    #[test]
    fn message_split_across_chunks_waits_for_delimiter() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(br#"{"suggestions":["hel"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(br#"lo"]}"#);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(words(item), vec!["hello"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn two_messages_in_one_chunk_decode_in_order() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::from(&b"{\"suggestions\":[\"hello\"]}\n{\"suggestions\":[\"world\"]}\n"[..]);

        let items = decode_all(&mut codec, &mut buf);
        assert_eq!(items.len(), 2);
        let mut items = items.into_iter();
        assert_eq!(words(items.next().unwrap()), vec!["hello"]);
        assert_eq!(words(items.next().unwrap()), vec!["world"]);
    }

    #[test]
    fn malformed_line_yields_error_item_and_stream_resumes() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::from(
            &b"{\"data\":[\"a\"]}\nError handling request: boom\n{\"data\":[\"c\"]}\n"[..],
        );

        let mut items = decode_all(&mut codec, &mut buf).into_iter();
        assert_eq!(words(items.next().unwrap()), vec!["a"]);
        assert!(matches!(
            items.next().unwrap(),
            Err(MalformedFrame::Invalid { .. })
        ));
        assert_eq!(words(items.next().unwrap()), vec!["c"]);
        assert!(items.next().is_none());
    }

    #[test]
    fn invalid_utf8_line_rejects_one_frame() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::from(&b"\xff\xfe not utf8\n{\"suggestions\":[\"ok\"]}\n"[..]);

        let mut items = decode_all(&mut codec, &mut buf).into_iter();
        assert!(matches!(items.next().unwrap(), Err(MalformedFrame::Encoding)));
        assert_eq!(words(items.next().unwrap()), vec!["ok"]);
        assert!(items.next().is_none());
    }

    #[test]
    fn invalid_utf8_tail_at_eof_is_reported() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::from(&b"{\"suggestions\":[\"\xc3"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let item = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Err(MalformedFrame::Encoding)));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn blank_lines_and_crlf_are_ignored() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::from(&b"\n\r\n{\"suggestions\":[\"x\"]}\r\n"[..]);

        let mut items = decode_all(&mut codec, &mut buf).into_iter();
        assert_eq!(words(items.next().unwrap()), vec!["x"]);
        assert!(items.next().is_none());
    }

    #[test]
    fn truncated_tail_at_eof_is_reported() {
        let mut codec = JsonLinesCodec::<LookupResponse>::new();
        let mut buf = BytesMut::from(&b"{\"suggestions\":[\"hel"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let item = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert!(matches!(item, Err(MalformedFrame::Truncated { .. })));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_line_is_discarded_then_decoding_continues() {
        let mut codec = JsonLinesCodec::<LookupResponse>::with_max_length(32);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("{{\"suggestions\":[\"{}\"]}}\n", "x".repeat(64)).as_bytes());
        buf.extend_from_slice(b"{\"suggestions\":[\"ok\"]}\n");

        let mut items = decode_all(&mut codec, &mut buf).into_iter();
        assert!(matches!(
            items.next().unwrap(),
            Err(MalformedFrame::Oversized { max: 32 })
        ));
        assert_eq!(words(items.next().unwrap()), vec!["ok"]);
    }
}
