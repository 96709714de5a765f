//! Incremental wire codec
//!
//! Frame layout: one JSON header line declaring the serialized byte
//! length of each present segment, followed by the segments in fixed
//! order (`error`, `stream`, `data`, `chunk`), each terminated by a
//! line feed. Declared lengths exclude the trailing line feed. The
//! JSON segments carry serialized values; `chunk` is raw bytes.
//!
//! Decoding is strictly sequential with a single in-flight frame per
//! connection. Any framing fault is fatal to the connection, not to a
//! single exchange.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::message::{Message, Method, StreamControl};

/// Maximum serialized size of a single segment (16MB)
pub const MAX_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Maximum length of the header line (64KB)
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Codec errors, all fatal to the connection
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed header: {0}")]
    MalformedHeader(serde_json::Error),

    #[error("header line exceeds {MAX_HEADER_SIZE} bytes")]
    HeaderTooLong,

    #[error("{segment} segment of {len} bytes exceeds maximum {max}")]
    SegmentTooLarge {
        segment: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed {segment} segment: {source}")]
    MalformedSegment {
        segment: &'static str,
        source: serde_json::Error,
    },

    #[error("missing segment separator")]
    MissingSeparator,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The header line record. Optional `usize` fields are the declared
/// byte lengths of the corresponding body segments.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<Method>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk: Option<usize>,
}

impl Header {
    fn declared(&self) -> [(&'static str, Option<usize>); 4] {
        [
            ("error", self.error),
            ("stream", self.stream),
            ("data", self.data),
            ("chunk", self.chunk),
        ]
    }

    fn has_body(&self) -> bool {
        self.error.is_some() || self.stream.is_some() || self.data.is_some() || self.chunk.is_some()
    }

    /// Total body length: each segment plus its line-feed separator.
    fn body_len(&self) -> usize {
        self.declared()
            .iter()
            .filter_map(|(_, len)| *len)
            .map(|len| len + 1)
            .sum()
    }
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    AwaitingHeader,
    AwaitingBody(Header),
}

/// Stateless encoder and incremental decoder for one connection.
#[derive(Debug)]
pub struct WireCodec {
    state: DecodeState,
    max_segment: usize,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_max_segment(MAX_SEGMENT_SIZE)
    }

    pub fn with_max_segment(max_segment: usize) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            max_segment,
        }
    }

    fn check_len(&self, segment: &'static str, len: usize) -> Result<(), CodecError> {
        if len > self.max_segment {
            return Err(CodecError::SegmentTooLarge {
                segment,
                len,
                max: self.max_segment,
            });
        }
        Ok(())
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off one declared segment and swallow its separator.
fn take_segment(body: &mut BytesMut, len: usize) -> Result<BytesMut, CodecError> {
    let segment = body.split_to(len);
    if body.split_to(1)[0] != b'\n' {
        return Err(CodecError::MissingSeparator);
    }
    Ok(segment)
}

fn parse_json<'de, T: Deserialize<'de>>(
    segment: &'static str,
    bytes: &'de [u8],
) -> Result<T, CodecError> {
    serde_json::from_slice(bytes).map_err(|source| CodecError::MalformedSegment { segment, source })
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        loop {
            match &self.state {
                DecodeState::AwaitingHeader => {
                    let Some(idx) = src.iter().position(|&b| b == b'\n') else {
                        if src.len() > MAX_HEADER_SIZE {
                            return Err(CodecError::HeaderTooLong);
                        }
                        return Ok(None);
                    };

                    let line = src.split_to(idx + 1);
                    let header: Header = serde_json::from_slice(&line[..idx])
                        .map_err(CodecError::MalformedHeader)?;

                    for (segment, len) in header.declared() {
                        if let Some(len) = len {
                            self.check_len(segment, len)?;
                        }
                    }

                    if !header.has_body() {
                        trace!(to = %header.to, "decoded frame");
                        return Ok(Some(Message {
                            to: header.to,
                            from: header.from,
                            method: header.method,
                            status: header.status,
                            ..Default::default()
                        }));
                    }

                    self.state = DecodeState::AwaitingBody(header);
                }
                DecodeState::AwaitingBody(header) => {
                    if src.len() < header.body_len() {
                        return Ok(None);
                    }

                    let DecodeState::AwaitingBody(header) = std::mem::take(&mut self.state) else {
                        unreachable!()
                    };

                    let mut body = src.split_to(header.body_len());

                    let error: Option<Value> = match header.error {
                        Some(len) => Some(parse_json("error", &take_segment(&mut body, len)?)?),
                        None => None,
                    };
                    let stream: Option<StreamControl> = match header.stream {
                        Some(len) => Some(parse_json("stream", &take_segment(&mut body, len)?)?),
                        None => None,
                    };
                    let data: Option<Value> = match header.data {
                        Some(len) => Some(parse_json("data", &take_segment(&mut body, len)?)?),
                        None => None,
                    };
                    let chunk: Option<Bytes> = match header.chunk {
                        Some(len) => Some(take_segment(&mut body, len)?.freeze()),
                        None => None,
                    };

                    trace!(to = %header.to, body = header.body_len(), "decoded frame");
                    return Ok(Some(Message {
                        to: header.to,
                        from: header.from,
                        method: header.method,
                        status: header.status,
                        error,
                        stream,
                        data,
                        chunk,
                    }));
                }
            }
        }
    }
}

impl Encoder<Message> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let error = msg
            .error
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|source| CodecError::MalformedSegment {
                segment: "error",
                source,
            })?;
        let stream = msg
            .stream
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|source| CodecError::MalformedSegment {
                segment: "stream",
                source,
            })?;
        let data = msg
            .data
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|source| CodecError::MalformedSegment {
                segment: "data",
                source,
            })?;

        let header = Header {
            to: msg.to,
            from: msg.from,
            method: msg.method,
            status: msg.status,
            error: error.as_ref().map(Vec::len),
            stream: stream.as_ref().map(Vec::len),
            data: data.as_ref().map(Vec::len),
            chunk: msg.chunk.as_ref().map(Bytes::len),
        };

        for (segment, len) in header.declared() {
            if let Some(len) = len {
                self.check_len(segment, len)?;
            }
        }

        let header_line =
            serde_json::to_vec(&header).map_err(|source| CodecError::MalformedSegment {
                segment: "header",
                source,
            })?;

        dst.reserve(header_line.len() + 1 + header.body_len());
        dst.put_slice(&header_line);
        dst.put_u8(b'\n');

        for segment in [error, stream, data].into_iter().flatten() {
            dst.put_slice(&segment);
            dst.put_u8(b'\n');
        }
        if let Some(chunk) = msg.chunk {
            dst.put_slice(&chunk);
            dst.put_u8(b'\n');
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;
    use serde_json::json;

    fn encode(msg: &Message) -> BytesMut {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        buf
    }

    fn decode_one(buf: &mut BytesMut) -> Option<Message> {
        WireCodec::new().decode(buf).unwrap()
    }

    fn round_trip(msg: Message) {
        let mut buf = encode(&msg);
        let decoded = decode_one(&mut buf).expect("complete frame");
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_round_trip_header_only() {
        round_trip(Message {
            to: "/hello".to_string(),
            from: Some("/#requests/p/1".to_string()),
            method: Some(Method::Get),
            ..Default::default()
        });
    }

    #[test]
    fn test_round_trip_all_fields() {
        round_trip(Message {
            to: "/hello".to_string(),
            from: Some("/#requests/p/1".to_string()),
            method: Some(Method::Post),
            status: None,
            error: Some(json!({"message": "nope"})),
            stream: Some(StreamControl::sink("/hello/#streams/p/2")),
            data: Some(json!({"key": [1, 2, 3]})),
            chunk: Some(Bytes::from_static(b"\x00\x01\xff\n binary")),
        });
    }

    #[test]
    fn test_round_trip_falsy_values_are_present() {
        for data in [json!(0), json!(false), json!({}), json!(null), json!("")] {
            round_trip(Message {
                to: "/x".to_string(),
                data: Some(data),
                ..Default::default()
            });
        }
    }

    #[test]
    fn test_round_trip_empty_chunk() {
        round_trip(Message {
            to: "/x".to_string(),
            chunk: Some(Bytes::new()),
            ..Default::default()
        });
    }

    #[test]
    fn test_round_trip_null_error_is_present() {
        // the explicit EOF signal, distinct from an absent error
        round_trip(Message {
            to: "/x".to_string(),
            error: Some(Value::Null),
            data: Some(json!("last")),
            ..Default::default()
        });
    }

    #[test]
    fn test_end_marker_survives_round_trip() {
        let msg = Message::end_marker("/a/#streams/p/1");
        let mut buf = encode(&msg);
        let decoded = decode_one(&mut buf).unwrap();
        assert!(decoded.is_end_marker());
    }

    #[test]
    fn test_declared_length_excludes_line_feed() {
        let msg = Message {
            to: "/x".to_string(),
            data: Some(json!("ab")),
            ..Default::default()
        };
        let buf = encode(&msg);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        let header_line = text.lines().next().unwrap();
        let header: serde_json::Value = serde_json::from_str(header_line).unwrap();
        // "ab" serializes to four bytes: "\"ab\""
        assert_eq!(header["data"], json!(4));
    }

    #[test]
    fn test_partial_arrival_invariance() {
        let messages = vec![
            Message {
                to: "/one".to_string(),
                method: Some(Method::Get),
                from: Some("/#requests/p/1".to_string()),
                ..Default::default()
            },
            Message {
                to: "/two".to_string(),
                data: Some(json!({"n": 42})),
                chunk: Some(Bytes::from_static(b"raw\nbytes")),
                ..Default::default()
            },
            Message::end_marker("/three"),
            Message {
                to: "/four".to_string(),
                status: Some(200),
                data: Some(json!("done")),
                ..Default::default()
            },
        ];

        let mut wire = BytesMut::new();
        let mut codec = WireCodec::new();
        for msg in &messages {
            codec.encode(msg.clone(), &mut wire).unwrap();
        }
        let wire = wire.freeze();

        for split in 1..=wire.len().min(64) {
            let mut codec = WireCodec::new();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            for fragment in wire.chunks(split) {
                buf.extend_from_slice(fragment);
                while let Some(msg) = codec.decode(&mut buf).unwrap() {
                    decoded.push(msg);
                }
            }
            assert_eq!(decoded, messages, "fragment size {split}");
        }
    }

    #[test]
    fn test_malformed_header_is_fatal() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_oversized_declared_length_is_fatal() {
        let mut codec = WireCodec::with_max_segment(16);
        let mut buf = BytesMut::from(&b"{\"to\":\"/x\",\"data\":1024}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::SegmentTooLarge { segment: "data", .. })
        ));
    }

    #[test]
    fn test_bad_segment_json_is_fatal() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"{\"to\":\"/x\",\"data\":3}\nnop\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MalformedSegment { segment: "data", .. })
        ));
    }

    #[test]
    fn test_missing_separator_is_fatal() {
        // declared length of 3 but the fourth byte is not a line feed
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"{\"to\":\"/x\",\"data\":3}\n123x"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MissingSeparator)
        ));
    }

    #[test]
    fn test_unterminated_header_within_limit_waits() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::from(&b"{\"to\":\"/x\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_oversized_segment_fails() {
        let mut codec = WireCodec::with_max_segment(4);
        let mut buf = BytesMut::new();
        let msg = Message {
            to: "/x".to_string(),
            chunk: Some(Bytes::from_static(b"way too large")),
            ..Default::default()
        };
        assert!(matches!(
            codec.encode(msg, &mut buf),
            Err(CodecError::SegmentTooLarge { segment: "chunk", .. })
        ));
    }
}
