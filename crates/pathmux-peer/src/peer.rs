//! Connection actor
//!
//! One `Peer` per duplex byte connection. A dispatch task owns the
//! handler table and the decode half of the framed transport; a writer
//! task drains the outbound message channel into the encode half. All
//! exchange state lives on the dispatch task, so handlers and request
//! futures talk to it through commands instead of locks.

use std::collections::hash_map::{Entry, HashMap};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, warn};
use uuid::Uuid;

use pathmux_proto::{
    reply_path, stream_path, validate_target_path, Body, Message, Method, StreamControl,
    WireCodec, MAX_SEGMENT_SIZE,
};

use crate::consumer::{BodyStream, BufferedConsumer};
use crate::initiator::{Ack, Initiator, OutboundRequest, RequestError, Response};
use crate::responder::{RAck, Request, Responder, ResponderExchange};
use crate::router::Router;

/// Tunables for a peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Upper bound on any single declared segment, in bytes
    pub max_segment_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_segment_size: MAX_SEGMENT_SIZE,
        }
    }
}

/// Instructions sent to the dispatch task by request futures, stream
/// handles, and responders.
pub(crate) enum Command {
    /// Register a new exchange, then emit its initial message. The
    /// message rides along so registration always precedes the write.
    Register {
        path: String,
        slot: HandlerSlot,
        init: Message,
    },
    UploadWrite {
        path: String,
        body: Body,
        ack: Ack,
    },
    UploadEnd {
        path: String,
        ack: Ack,
    },
    /// A stream reader attached; replay anything queued for it.
    Activate {
        path: String,
    },
    /// A stream reader was dropped before the end.
    CancelStream {
        path: String,
    },
    AbortRequest {
        path: String,
    },
    Respond {
        path: String,
        status: u16,
        body: Body,
        error: Option<Value>,
        ack: RAck,
    },
    SourceWrite {
        path: String,
        body: Body,
        ack: RAck,
    },
    SourceEnd {
        path: String,
        status: u16,
        body: Option<Body>,
        ack: RAck,
    },
    Destroy {
        path: String,
        error: Value,
    },
    HandlerFailed {
        path: String,
        message: String,
    },
    Close,
}

pub(crate) enum HandlerSlot {
    Client(Initiator),
    Responder(ResponderExchange),
}

/// Handle to a multiplexed peer connection.
///
/// Cloning is cheap; all clones drive the same connection. Dropping
/// every handle does not close the connection (in-flight exchanges
/// keep it alive); call [`Peer::close`] for an orderly local shutdown.
#[derive(Clone)]
pub struct Peer {
    id: Arc<String>,
    cmd: mpsc::UnboundedSender<Command>,
    out: mpsc::UnboundedSender<Message>,
}

impl Peer {
    /// Takes ownership of a duplex transport and spawns the dispatch
    /// and writer tasks.
    pub fn bind<T>(io: T, router: Router) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::bind_with_config(io, router, PeerConfig::default())
    }

    pub fn bind_with_config<T>(io: T, router: Router, config: PeerConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = Arc::new(Uuid::new_v4().to_string());
        let framed = Framed::new(io, WireCodec::with_max_segment(config.max_segment_size));
        let (mut sink, frames) = framed.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = sink.send(msg).await {
                    debug!(error = %err, "transport write failed");
                    break;
                }
            }
        });

        let dispatcher = Dispatcher {
            peer_id: id.clone(),
            router: Arc::new(router),
            handlers: HashMap::new(),
            out: out_tx.clone(),
            cmd: cmd_tx.clone(),
        };
        tokio::spawn(dispatcher.run(frames, cmd_rx));

        Self {
            id,
            cmd: cmd_tx,
            out: out_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Issues a non-streaming request and awaits the terminal reply.
    pub async fn request(
        &self,
        method: Method,
        to: impl Into<String>,
        body: Body,
    ) -> Result<Response, RequestError> {
        self.start(method, to.into(), body, false)?.response().await
    }

    /// Issues a streaming request. The returned handle uploads the
    /// body and resolves to the reply.
    pub fn request_upload(
        &self,
        method: Method,
        to: impl Into<String>,
    ) -> Result<OutboundRequest, RequestError> {
        self.start(method, to.into(), Body::default(), true)
    }

    pub async fn get(&self, to: impl Into<String>) -> Result<Response, RequestError> {
        self.request(Method::Get, to, Body::default()).await
    }

    pub async fn post(
        &self,
        to: impl Into<String>,
        body: Body,
    ) -> Result<Response, RequestError> {
        self.request(Method::Post, to, body).await
    }

    pub async fn put(
        &self,
        to: impl Into<String>,
        body: Body,
    ) -> Result<Response, RequestError> {
        self.request(Method::Put, to, body).await
    }

    pub async fn patch(
        &self,
        to: impl Into<String>,
        body: Body,
    ) -> Result<Response, RequestError> {
        self.request(Method::Patch, to, body).await
    }

    pub async fn delete(&self, to: impl Into<String>) -> Result<Response, RequestError> {
        self.request(Method::Delete, to, Body::default()).await
    }

    /// Orderly local shutdown: every live exchange sees a
    /// connection-lost notification, then the dispatch task exits.
    pub fn close(&self) {
        let _ = self.cmd.send(Command::Close);
    }

    fn start(
        &self,
        method: Method,
        to: String,
        body: Body,
        streaming: bool,
    ) -> Result<OutboundRequest, RequestError> {
        validate_target_path(&to)?;
        let id = Uuid::new_v4();
        let path = reply_path(&self.id, &id);

        let (reply_tx, reply_rx) = oneshot::channel();
        let initiator = Initiator::new(
            path.clone(),
            self.out.clone(),
            self.cmd.clone(),
            reply_tx,
            streaming,
        );
        let init = Message {
            to,
            from: Some(path.clone()),
            method: Some(method),
            data: body.data,
            chunk: body.chunk,
            stream: streaming.then(StreamControl::default),
            ..Default::default()
        };
        self.cmd
            .send(Command::Register {
                path: path.clone(),
                slot: HandlerSlot::Client(initiator),
                init,
            })
            .map_err(|_| RequestError::PeerClosed)?;
        Ok(OutboundRequest::new(path, self.cmd.clone(), reply_rx))
    }
}

struct Dispatcher {
    peer_id: Arc<String>,
    router: Arc<Router>,
    handlers: HashMap<String, HandlerSlot>,
    out: mpsc::UnboundedSender<Message>,
    cmd: mpsc::UnboundedSender<Command>,
}

impl Dispatcher {
    async fn run<S>(mut self, mut frames: S, mut cmd_rx: mpsc::UnboundedReceiver<Command>)
    where
        S: futures::Stream<Item = Result<Message, pathmux_proto::CodecError>> + Unpin,
    {
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(msg)) => self.dispatch(msg),
                    Some(Err(err)) => {
                        // framing faults are unrecoverable for the
                        // whole connection
                        warn!(peer = %self.peer_id, error = %err, "transport decode failed");
                        break;
                    }
                    None => {
                        debug!(peer = %self.peer_id, "connection closed by remote");
                        break;
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Close) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
            }
        }
        self.disconnect_all();
    }

    fn dispatch(&mut self, msg: Message) {
        match self.handlers.entry(msg.to.clone()) {
            Entry::Occupied(mut entry) => {
                let done = match entry.get_mut() {
                    HandlerSlot::Client(initiator) => initiator.handle_message(msg),
                    HandlerSlot::Responder(responder) => responder.handle_message(msg),
                };
                if done {
                    entry.remove();
                }
            }
            Entry::Vacant(_) => {
                if msg.method.is_some() {
                    self.accept_request(msg);
                } else {
                    debug!(to = %msg.to, "unroutable message dropped");
                }
            }
        }
    }

    fn accept_request(&mut self, msg: Message) {
        let Some(method) = msg.method else {
            return;
        };
        // no auto-generated reply for unmatched paths; applications
        // wanting 404 semantics mount a catch-all at "/"
        let Some(handler) = self.router.lookup(&msg.to) else {
            debug!(method = %method, to = %msg.to, "no route");
            return;
        };

        let id = Uuid::new_v4();
        let path = stream_path(&msg.to, &self.peer_id, &id);

        // a stream field on the request announces an upload body
        let (upload, body) = if msg.stream.is_some() {
            let (consumer, rx) = BufferedConsumer::new();
            let stream = BodyStream::new(path.clone(), self.cmd.clone(), rx);
            (Some(consumer), Some(stream))
        } else {
            (None, None)
        };

        let (exchange, events) = ResponderExchange::new(
            path.clone(),
            msg.from.clone(),
            self.out.clone(),
            upload,
        );
        self.handlers
            .insert(path.clone(), HandlerSlot::Responder(exchange));

        let request = Request {
            method,
            path: msg.to,
            from: msg.from,
            data: msg.data,
            chunk: msg.chunk,
            body,
        };
        let responder = Responder::new(path.clone(), self.cmd.clone(), events);

        let cmd = self.cmd.clone();
        tokio::spawn(async move {
            if let Err(err) = handler.handle(request, responder).await {
                let _ = cmd.send(Command::HandlerFailed {
                    path,
                    message: err.to_string(),
                });
            }
        });
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register { path, slot, init } => {
                self.handlers.insert(path, slot);
                let _ = self.out.send(init);
            }
            Command::UploadWrite { path, body, ack } => {
                match self.handlers.get_mut(&path) {
                    Some(HandlerSlot::Client(initiator)) => initiator.write(body, ack),
                    _ => {
                        let _ = ack.send(Err(RequestError::Terminated));
                    }
                }
            }
            Command::UploadEnd { path, ack } => match self.handlers.get_mut(&path) {
                Some(HandlerSlot::Client(initiator)) => initiator.end(ack),
                _ => {
                    let _ = ack.send(Err(RequestError::Terminated));
                }
            },
            Command::Activate { path } => {
                let done = match self.handlers.get_mut(&path) {
                    Some(HandlerSlot::Client(initiator)) => initiator.activate(),
                    Some(HandlerSlot::Responder(responder)) => responder.activate(),
                    None => false,
                };
                if done {
                    self.handlers.remove(&path);
                }
            }
            Command::CancelStream { path } => {
                let done = match self.handlers.get_mut(&path) {
                    Some(HandlerSlot::Client(initiator)) => initiator.cancel_stream(),
                    Some(HandlerSlot::Responder(responder)) => responder.cancel_upload(),
                    None => false,
                };
                if done {
                    self.handlers.remove(&path);
                }
            }
            Command::AbortRequest { path } => {
                if let Some(HandlerSlot::Client(mut initiator)) = self.handlers.remove(&path) {
                    initiator.abort();
                }
            }
            Command::Respond {
                path,
                status,
                body,
                error,
                ack,
            } => self.with_responder(&path, ack, |responder, ack| {
                responder.respond(status, body, error, ack)
            }),
            Command::SourceWrite { path, body, ack } => {
                self.with_responder(&path, ack, |responder, ack| {
                    responder.source_write(body, ack)
                })
            }
            Command::SourceEnd {
                path,
                status,
                body,
                ack,
            } => self.with_responder(&path, ack, |responder, ack| {
                responder.source_end(status, body, ack)
            }),
            Command::Destroy { path, error } => {
                if let Some(HandlerSlot::Responder(responder)) = self.handlers.get_mut(&path) {
                    if responder.destroy(error) {
                        self.handlers.remove(&path);
                    }
                }
            }
            Command::HandlerFailed { path, message } => {
                if let Some(HandlerSlot::Responder(responder)) = self.handlers.get_mut(&path) {
                    if responder.handler_failed(message) {
                        self.handlers.remove(&path);
                    }
                }
            }
            Command::Close => {}
        }
    }

    fn with_responder(
        &mut self,
        path: &str,
        ack: RAck,
        f: impl FnOnce(&mut ResponderExchange, RAck) -> bool,
    ) {
        match self.handlers.get_mut(path) {
            Some(HandlerSlot::Responder(responder)) => {
                if f(responder, ack) {
                    self.handlers.remove(path);
                }
            }
            _ => {
                let _ = ack.send(Err(crate::responder::ResponderError::Closed));
            }
        }
    }

    fn disconnect_all(&mut self) {
        for (_, slot) in self.handlers.drain() {
            match slot {
                HandlerSlot::Client(mut initiator) => initiator.connection_lost(),
                HandlerSlot::Responder(mut responder) => responder.connection_lost(),
            }
        }
    }
}
