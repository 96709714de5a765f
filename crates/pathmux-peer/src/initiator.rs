//! Client exchange state machine
//!
//! One `Initiator` drives one outbound request:
//!
//! | state       | entered when                       | accepts                         |
//! |-------------|------------------------------------|---------------------------------|
//! | Handshaking | upload request constructed         | sink announcement               |
//! | Requesting  | sink path obtained                 | local writes and end            |
//! | Requested   | plain request, or upload finished  | terminal or provisional status  |
//! | Responded   | success status arrived             | download stream traffic         |
//! | Failed      | error, failure status, or illegal  | (terminal)                      |
//!
//! Non-streaming requests skip straight to `Requested`. Illegal
//! messages fail the exchange loudly rather than being ignored.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use pathmux_proto::{
    is_failure, is_provisional, is_success, Body, Message, Method, PathError,
};

use crate::consumer::{BodyStream, BufferedConsumer, StreamEvent};
use crate::peer::Command;

/// Request failures surfaced to the caller
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("request failed with status {status}")]
    Status { status: u16, error: Option<Value> },

    #[error("request aborted")]
    Aborted { error: Option<Value> },

    #[error("illegal message for exchange state: {0}")]
    IllegalMessage(&'static str),

    #[error("a write is already buffered pending the sink handshake")]
    HandshakePending,

    #[error("request body already ended")]
    AlreadyEnded,

    #[error("exchange terminated")]
    Terminated,

    #[error("connection lost")]
    ConnectionLost,

    #[error("peer closed")]
    PeerClosed,

    #[error(transparent)]
    Path(#[from] PathError),
}

/// The resolved result of a request.
///
/// `stream`, when present, is the ordered download sequence announced
/// by the responder alongside the status.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub data: Option<Value>,
    pub chunk: Option<Bytes>,
    pub stream: Option<BodyStream>,
}

pub(crate) type Ack = oneshot::Sender<Result<(), RequestError>>;

#[derive(Debug)]
enum PendingOp {
    Write { body: Body, ack: Ack },
    End { ack: Ack },
}

#[derive(Debug)]
enum State {
    Handshaking,
    Requesting,
    Requested,
    Responded {
        stream: Option<BufferedConsumer>,
        source: Option<String>,
    },
    Failed(RequestError),
}

/// Peer-task side of one outbound request.
pub(crate) struct Initiator {
    /// Reply path, also the handler-table key
    path: String,
    out: mpsc::UnboundedSender<Message>,
    cmd: mpsc::UnboundedSender<Command>,
    reply: Option<oneshot::Sender<Result<Response, RequestError>>>,
    state: State,
    sink: Option<String>,
    pending: Option<PendingOp>,
}

impl Initiator {
    pub fn new(
        path: String,
        out: mpsc::UnboundedSender<Message>,
        cmd: mpsc::UnboundedSender<Command>,
        reply: oneshot::Sender<Result<Response, RequestError>>,
        streaming: bool,
    ) -> Self {
        Self {
            path,
            out,
            cmd,
            reply: Some(reply),
            state: if streaming {
                State::Handshaking
            } else {
                State::Requested
            },
            sink: None,
            pending: None,
        }
    }

    /// Process one inbound message. Returns true when the exchange is
    /// terminal and its table entry should be released.
    pub fn handle_message(&mut self, msg: Message) -> bool {
        match &mut self.state {
            State::Handshaking => {
                let sink = msg.stream.as_ref().and_then(|s| s.sink.clone());
                let provisional = msg.status.map_or(true, is_provisional) && msg.error.is_none();
                match sink {
                    Some(sink_path) if provisional => {
                        self.sink = Some(sink_path);
                        self.state = State::Requesting;
                        self.flush_pending();
                        false
                    }
                    _ => self.fail(failure_of(&msg).unwrap_or(RequestError::IllegalMessage(
                        "expected a sink announcement",
                    ))),
                }
            }
            State::Requesting => self.fail(failure_of(&msg).unwrap_or(
                RequestError::IllegalMessage("unexpected message while uploading"),
            )),
            State::Requested => {
                if let Some(err) = failure_of(&msg) {
                    return self.fail(err);
                }
                let has_source = msg
                    .stream
                    .as_ref()
                    .map_or(false, |s| s.source.is_some());
                match msg.status {
                    Some(status) if is_success(status) => self.respond(status, msg),
                    // a provisional status announcing a download source
                    // opens the stream ahead of any final status
                    Some(status) if is_provisional(status) && has_source => {
                        self.respond(status, msg)
                    }
                    _ => self.fail(RequestError::IllegalMessage("expected a terminal status")),
                }
            }
            State::Responded { stream, .. } => {
                let Some(consumer) = stream else {
                    debug!(path = %self.path, "message for completed exchange dropped");
                    return true;
                };
                match msg.error {
                    Some(Value::Null) => {
                        // EOF piggybacked onto the final write
                        if msg.has_body() {
                            consumer.push(StreamEvent::Item(msg.body()));
                        }
                        consumer.push(StreamEvent::End);
                        consumer.is_active()
                    }
                    Some(error) => {
                        consumer.push(StreamEvent::Error(error));
                        consumer.is_active()
                    }
                    None if msg.has_body() => {
                        consumer.push(StreamEvent::Item(msg.body()));
                        false
                    }
                    None if msg.status.is_some() => {
                        debug!(path = %self.path, "ignoring trailing status on open stream");
                        false
                    }
                    None => {
                        consumer.push(StreamEvent::End);
                        consumer.is_active()
                    }
                }
            }
            State::Failed(_) => true,
        }
    }

    /// Local write. Buffered (at most one operation) while the sink
    /// handshake is outstanding.
    pub fn write(&mut self, body: Body, ack: Ack) {
        match &self.state {
            State::Handshaking => {
                if self.pending.is_some() {
                    let _ = ack.send(Err(RequestError::HandshakePending));
                } else {
                    self.pending = Some(PendingOp::Write { body, ack });
                }
            }
            State::Requesting => {
                self.send_item(body);
                let _ = ack.send(Ok(()));
            }
            State::Failed(err) => {
                let _ = ack.send(Err(err.clone()));
            }
            _ => {
                let _ = ack.send(Err(RequestError::AlreadyEnded));
            }
        }
    }

    /// Local end of the upload body.
    pub fn end(&mut self, ack: Ack) {
        match &self.state {
            State::Handshaking => {
                if self.pending.is_some() {
                    let _ = ack.send(Err(RequestError::HandshakePending));
                } else {
                    self.pending = Some(PendingOp::End { ack });
                }
            }
            State::Requesting => {
                self.send_end();
                self.state = State::Requested;
                let _ = ack.send(Ok(()));
            }
            State::Failed(err) => {
                let _ = ack.send(Err(err.clone()));
            }
            _ => {
                let _ = ack.send(Err(RequestError::AlreadyEnded));
            }
        }
    }

    /// Replay queued download events to the attached consumer. Returns
    /// true when the stream already finished and the entry can go.
    pub fn activate(&mut self) -> bool {
        if let State::Responded {
            stream: Some(consumer),
            ..
        } = &mut self.state
        {
            consumer.activate();
            consumer.is_finished()
        } else {
            false
        }
    }

    /// Local cancellation of an open download. Returns true when the
    /// entry should be released.
    pub fn cancel_stream(&mut self) -> bool {
        match &mut self.state {
            State::Responded {
                stream: Some(consumer),
                source,
            } => {
                if !consumer.is_finished() {
                    if let Some(source_path) = source.take() {
                        let _ = self.out.send(Message {
                            to: source_path,
                            from: Some(self.path.clone()),
                            method: Some(Method::Delete),
                            ..Default::default()
                        });
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Caller abandoned the exchange. Tells the remote side to stop
    /// whatever stream is still flowing; always releases the entry.
    pub fn abort(&mut self) {
        match &self.state {
            State::Requesting => {
                if let Some(sink) = &self.sink {
                    let _ = self.out.send(Message {
                        to: sink.clone(),
                        from: Some(self.path.clone()),
                        error: Some(Value::String("aborted".to_string())),
                        ..Default::default()
                    });
                }
            }
            State::Responded { .. } => {
                self.cancel_stream();
            }
            _ => {}
        }
    }

    /// Connection-level fault: fail whatever is outstanding, exactly once.
    pub fn connection_lost(&mut self) {
        match &mut self.state {
            State::Responded {
                stream: Some(consumer),
                ..
            } => {
                // force-flush so early data is not lost behind the error
                consumer.activate();
                consumer.push(StreamEvent::ConnectionLost);
            }
            State::Responded { stream: None, .. } | State::Failed(_) => {}
            _ => {
                if let Some(op) = self.pending.take() {
                    op.nack(RequestError::ConnectionLost);
                }
                self.resolve(Err(RequestError::ConnectionLost));
            }
        }
        self.state = State::Failed(RequestError::ConnectionLost);
    }

    fn respond(&mut self, status: u16, msg: Message) -> bool {
        let source = msg.stream.and_then(|s| s.source);
        if let Some(source_path) = source {
            let (consumer, rx) = BufferedConsumer::new();
            let stream = BodyStream::new(self.path.clone(), self.cmd.clone(), rx);
            self.state = State::Responded {
                stream: Some(consumer),
                source: Some(source_path),
            };
            self.resolve(Ok(Response {
                status,
                data: msg.data,
                chunk: msg.chunk,
                stream: Some(stream),
            }));
            false
        } else {
            self.state = State::Responded {
                stream: None,
                source: None,
            };
            self.resolve(Ok(Response {
                status,
                data: msg.data,
                chunk: msg.chunk,
                stream: None,
            }));
            true
        }
    }

    fn fail(&mut self, err: RequestError) -> bool {
        if let Some(op) = self.pending.take() {
            op.nack(err.clone());
        }
        self.resolve(Err(err.clone()));
        self.state = State::Failed(err);
        true
    }

    fn resolve(&mut self, result: Result<Response, RequestError>) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(result);
        }
    }

    fn flush_pending(&mut self) {
        match self.pending.take() {
            Some(PendingOp::Write { body, ack }) => {
                self.send_item(body);
                let _ = ack.send(Ok(()));
            }
            Some(PendingOp::End { ack }) => {
                self.send_end();
                self.state = State::Requested;
                let _ = ack.send(Ok(()));
            }
            None => {}
        }
    }

    fn send_item(&mut self, body: Body) {
        if let Some(sink) = &self.sink {
            let _ = self.out.send(Message {
                to: sink.clone(),
                from: Some(self.path.clone()),
                data: body.data,
                chunk: body.chunk,
                ..Default::default()
            });
        }
    }

    fn send_end(&mut self) {
        if let Some(sink) = &self.sink {
            let _ = self.out.send(Message::end_marker(sink.clone()));
        }
    }
}

impl PendingOp {
    fn nack(self, err: RequestError) {
        let ack = match self {
            PendingOp::Write { ack, .. } => ack,
            PendingOp::End { ack } => ack,
        };
        let _ = ack.send(Err(err));
    }
}

/// Caller-side handle for a streaming request body.
///
/// Writes and the end marker route through the peer task so they stay
/// ordered with the sink handshake. Dropping the handle without
/// calling [`OutboundRequest::response`] abandons the exchange.
#[derive(Debug)]
pub struct OutboundRequest {
    path: String,
    cmd: mpsc::UnboundedSender<Command>,
    reply: oneshot::Receiver<Result<Response, RequestError>>,
}

impl OutboundRequest {
    pub(crate) fn new(
        path: String,
        cmd: mpsc::UnboundedSender<Command>,
        reply: oneshot::Receiver<Result<Response, RequestError>>,
    ) -> Self {
        Self { path, cmd, reply }
    }

    /// Send one body item. Completes once the item is on its way or
    /// buffered behind the sink handshake.
    pub async fn write(&mut self, body: Body) -> Result<(), RequestError> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd
            .send(Command::UploadWrite {
                path: self.path.clone(),
                body,
                ack,
            })
            .map_err(|_| RequestError::PeerClosed)?;
        ack_rx.await.map_err(|_| RequestError::PeerClosed)?
    }

    /// Terminate the request body. The responder replies only after
    /// seeing this.
    pub async fn end(&mut self) -> Result<(), RequestError> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd
            .send(Command::UploadEnd {
                path: self.path.clone(),
                ack,
            })
            .map_err(|_| RequestError::PeerClosed)?;
        ack_rx.await.map_err(|_| RequestError::PeerClosed)?
    }

    /// Await the responder's terminal status.
    pub async fn response(self) -> Result<Response, RequestError> {
        self.reply.await.map_err(|_| RequestError::PeerClosed)?
    }

    /// Give up on the exchange without waiting for a reply.
    pub fn abort(self) {
        let _ = self.cmd.send(Command::AbortRequest {
            path: self.path.clone(),
        });
    }
}

/// An inbound `error` payload or failure status turns into a request
/// failure; `error: null` never does (it is the EOF signal).
fn failure_of(msg: &Message) -> Option<RequestError> {
    if let Some(error) = &msg.error {
        if !error.is_null() {
            return Some(match msg.status {
                Some(status) if is_failure(status) => RequestError::Status {
                    status,
                    error: Some(error.clone()),
                },
                _ => RequestError::Aborted {
                    error: Some(error.clone()),
                },
            });
        }
    }
    match msg.status {
        Some(status) if is_failure(status) => Some(RequestError::Status {
            status,
            error: None,
        }),
        _ => None,
    }
}
