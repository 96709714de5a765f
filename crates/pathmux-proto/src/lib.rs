//! Pathmux Protocol Definitions
//!
//! This crate defines the wire envelope, path rules, and the incremental
//! codec for the path-multiplexed peer protocol. Every frame on a
//! connection is one [`Message`], addressed to a hierarchical path that
//! identifies the exchange it belongs to.

pub mod codec;
pub mod message;
pub mod path;

pub use codec::{CodecError, WireCodec, MAX_HEADER_SIZE, MAX_SEGMENT_SIZE};
pub use message::{
    is_failure, is_provisional, is_success, Body, Message, Method, StreamControl,
};
pub use path::{
    reply_path, stream_path, validate_target_path, PathError, REQUESTS_NS, STREAMS_SEGMENT,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
