//! Wire envelope types

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request verbs understood by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Announces a stream address opened by the sender.
///
/// A `sink` is a responder-allocated path accepting an upload stream;
/// a `source` is a responder-allocated path from which a download
/// stream is pushed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamControl {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl StreamControl {
    pub fn sink(path: impl Into<String>) -> Self {
        Self {
            sink: Some(path.into()),
            source: None,
        }
    }

    pub fn source(path: impl Into<String>) -> Self {
        Self {
            sink: None,
            source: Some(path.into()),
        }
    }
}

/// One element of a message body or streamed sequence.
///
/// `data` is any JSON value (`null`, `0`, `false`, and `{}` are all
/// present values, distinct from absent); `chunk` is raw binary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub data: Option<Value>,
    pub chunk: Option<Bytes>,
}

impl Body {
    pub fn data(value: impl Into<Value>) -> Self {
        Self {
            data: Some(value.into()),
            chunk: None,
        }
    }

    pub fn chunk(chunk: impl Into<Bytes>) -> Self {
        Self {
            data: None,
            chunk: Some(chunk.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.chunk.is_none()
    }
}

/// The wire envelope, one instance per frame.
///
/// All fields but `to` are optional. A message with neither `data`,
/// `chunk`, `error`, nor any other marker, addressed to an active
/// stream path, is the canonical end-of-stream marker for that path.
/// `error: Some(Value::Null)` is the explicit non-error end-of-stream
/// signal some senders piggyback onto the final data write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub to: String,
    pub from: Option<String>,
    pub method: Option<Method>,
    pub status: Option<u16>,
    pub error: Option<Value>,
    pub stream: Option<StreamControl>,
    pub data: Option<Value>,
    pub chunk: Option<Bytes>,
}

impl Message {
    pub fn new(to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            ..Default::default()
        }
    }

    /// The clean-closure marker for a stream path.
    pub fn end_marker(to: impl Into<String>) -> Self {
        Self::new(to)
    }

    /// True when this message is an end-of-stream marker: no payload,
    /// no error, no status, no method, no stream announcement.
    pub fn is_end_marker(&self) -> bool {
        self.method.is_none()
            && self.status.is_none()
            && self.error.is_none()
            && self.stream.is_none()
            && self.data.is_none()
            && self.chunk.is_none()
    }

    pub fn body(&self) -> Body {
        Body {
            data: self.data.clone(),
            chunk: self.chunk.clone(),
        }
    }

    pub fn has_body(&self) -> bool {
        self.data.is_some() || self.chunk.is_some()
    }
}

/// 1xx, a stream handshake announcement precedes the final status
pub fn is_provisional(status: u16) -> bool {
    (100..200).contains(&status)
}

/// 2xx
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// 4xx or 5xx
pub fn is_failure(status: u16) -> bool {
    (400..600).contains(&status)
}
