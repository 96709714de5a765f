//! Path-addressed exchange multiplexing over one duplex connection.
//!
//! A [`Peer`] drives both sides of the protocol: it issues requests
//! (plain, uploading, or downloading) and serves inbound ones through
//! a [`Router`]. Every exchange is correlated by a hierarchical path
//! rather than a connection-level id, so arbitrarily many exchanges
//! interleave on a single byte stream.
//!
//! ```no_run
//! use pathmux_peer::{handler_fn, Peer, Router};
//! use pathmux_proto::Body;
//! use serde_json::json;
//!
//! # async fn demo(io: tokio::io::DuplexStream) -> Result<(), Box<dyn std::error::Error>> {
//! let router = Router::new().route(
//!     "/hello",
//!     handler_fn(|_request, responder| async move {
//!         responder.send(Body::data(json!("world"))).await?;
//!         Ok(())
//!     }),
//! );
//! let peer = Peer::bind(io, router);
//! let response = peer.get("/hello").await?;
//! assert_eq!(response.data, Some(json!("world")));
//! # Ok(())
//! # }
//! ```

mod consumer;
mod initiator;
mod peer;
mod responder;
mod router;

pub use consumer::{BodyStream, StreamError};
pub use initiator::{OutboundRequest, RequestError, Response};
pub use peer::{Peer, PeerConfig};
pub use responder::{Request, Responder, ResponderError, ResponderEvent, ResponderEvents};
pub use router::{handler_fn, FnHandler, HandlerError, RouteHandler, Router};

pub use pathmux_proto::{Body, Message, Method};
