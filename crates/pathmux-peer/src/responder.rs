//! Server side of an exchange
//!
//! `ResponderExchange` lives in the peer task and owns the exchange
//! state; `Responder` is the handle passed to route handlers. A
//! responder starts in `Ready` and either answers in one shot
//! ([`Responder::send`] / [`Responder::fail`]) or upgrades lazily to a
//! source stream on the first [`Responder::write`]. Upload bodies
//! arrive through the sink announced at construction time.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use pathmux_proto::{Body, Message, Method, StreamControl};

use crate::consumer::{BodyStream, BufferedConsumer, StreamEvent};
use crate::peer::Command;

/// Failures surfaced to route handlers driving a [`Responder`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResponderError {
    #[error("exchange already closed")]
    Closed,

    #[error("exchange aborted by the requester")]
    Aborted,

    #[error("a terminal reply was already sent")]
    AlreadyResponded,

    #[error("peer closed")]
    PeerClosed,
}

/// Lifecycle notifications for a responder-side exchange.
///
/// `Closed` is emitted exactly once per exchange, always last. An
/// aborted exchange sees `Aborted` strictly before `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderEvent {
    Aborted,
    ConnectionLost,
    Closed,
}

/// Receiver half for [`ResponderEvent`] notifications.
pub struct ResponderEvents {
    rx: mpsc::UnboundedReceiver<ResponderEvent>,
}

impl ResponderEvents {
    pub async fn next(&mut self) -> Option<ResponderEvent> {
        self.rx.recv().await
    }
}

pub(crate) type RAck = oneshot::Sender<Result<(), ResponderError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Streaming,
    Terminated,
}

/// Peer-task side of one inbound request.
pub(crate) struct ResponderExchange {
    /// Stream path for this exchange, also the handler-table key
    path: String,
    /// Requester's reply path
    reply_to: Option<String>,
    out: mpsc::UnboundedSender<Message>,
    phase: Phase,
    upload: Option<BufferedConsumer>,
    events: mpsc::UnboundedSender<ResponderEvent>,
    aborted: bool,
}

impl ResponderExchange {
    /// Builds the exchange and, when the request carries an upload
    /// body, immediately announces the sink so the requester can start
    /// writing.
    pub fn new(
        path: String,
        reply_to: Option<String>,
        out: mpsc::UnboundedSender<Message>,
        upload: Option<BufferedConsumer>,
    ) -> (Self, ResponderEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if upload.is_some() {
            if let Some(to) = &reply_to {
                let _ = out.send(Message {
                    to: to.clone(),
                    from: Some(path.clone()),
                    status: Some(100),
                    stream: Some(StreamControl::sink(path.clone())),
                    ..Default::default()
                });
            }
        }
        (
            Self {
                path,
                reply_to,
                out,
                phase: Phase::Ready,
                upload,
                events: events_tx,
                aborted: false,
            },
            ResponderEvents { rx: events_rx },
        )
    }

    /// Process an inbound message addressed to this exchange. Returns
    /// true when the exchange is terminal and should be released.
    pub fn handle_message(&mut self, msg: Message) -> bool {
        if msg.method == Some(Method::Delete) {
            return self.abort(msg.error);
        }
        let Some(consumer) = &mut self.upload else {
            debug!(path = %self.path, "message for sink-less exchange dropped");
            return false;
        };
        match msg.error {
            Some(Value::Null) => {
                if msg.has_body() {
                    consumer.push(StreamEvent::Item(msg.body()));
                }
                consumer.push(StreamEvent::End);
            }
            Some(error) => {
                // requester destroyed its upload mid-body
                consumer.push(StreamEvent::Error(error));
                return self.abort(None);
            }
            None if msg.has_body() => {
                consumer.push(StreamEvent::Item(msg.body()));
            }
            None => {
                consumer.push(StreamEvent::End);
            }
        }
        self.released()
    }

    /// One-shot terminal reply. Failure payloads travel in the error
    /// segment of the wire message.
    pub fn respond(
        &mut self,
        status: u16,
        body: Body,
        error: Option<Value>,
        ack: RAck,
    ) -> bool {
        match self.phase {
            Phase::Ready => {
                self.send(Message {
                    to: self.reply_to.clone().unwrap_or_default(),
                    from: Some(self.path.clone()),
                    status: Some(status),
                    error,
                    data: body.data,
                    chunk: body.chunk,
                    ..Default::default()
                });
                let _ = ack.send(Ok(()));
                self.terminate()
            }
            Phase::Streaming => {
                let _ = ack.send(Err(ResponderError::AlreadyResponded));
                false
            }
            Phase::Terminated => {
                let _ = ack.send(Err(self.closed_error()));
                self.released()
            }
        }
    }

    /// Streaming write. The first one upgrades the reply to a source
    /// stream with a provisional status.
    pub fn source_write(&mut self, body: Body, ack: RAck) -> bool {
        match self.phase {
            Phase::Ready => {
                self.send(Message {
                    to: self.reply_to.clone().unwrap_or_default(),
                    from: Some(self.path.clone()),
                    status: Some(100),
                    stream: Some(StreamControl::source(self.path.clone())),
                    ..Default::default()
                });
                self.phase = Phase::Streaming;
                self.send_item(body);
                let _ = ack.send(Ok(()));
                false
            }
            Phase::Streaming => {
                self.send_item(body);
                let _ = ack.send(Ok(()));
                false
            }
            Phase::Terminated => {
                let _ = ack.send(Err(self.closed_error()));
                self.released()
            }
        }
    }

    /// Terminates the reply stream. Before any write this degenerates
    /// to a one-shot status reply; mid-stream, a final body rides the
    /// EOF marker as `error: null`.
    pub fn source_end(
        &mut self,
        status: u16,
        body: Option<Body>,
        ack: RAck,
    ) -> bool {
        match self.phase {
            Phase::Ready => {
                let body = body.unwrap_or_default();
                self.respond(status, body, None, ack)
            }
            Phase::Streaming => {
                match body {
                    Some(body) => self.send(Message {
                        to: self.reply_to.clone().unwrap_or_default(),
                        from: Some(self.path.clone()),
                        error: Some(Value::Null),
                        data: body.data,
                        chunk: body.chunk,
                        ..Default::default()
                    }),
                    None => {
                        let to = self.reply_to.clone().unwrap_or_default();
                        self.send(Message::end_marker(to));
                    }
                }
                let _ = ack.send(Ok(()));
                self.terminate()
            }
            Phase::Terminated => {
                let _ = ack.send(Err(self.closed_error()));
                self.released()
            }
        }
    }

    /// Error the exchange towards the requester.
    pub fn destroy(&mut self, error: Value) -> bool {
        match self.phase {
            Phase::Ready => {
                self.send(Message {
                    to: self.reply_to.clone().unwrap_or_default(),
                    from: Some(self.path.clone()),
                    status: Some(500),
                    error: Some(error),
                    ..Default::default()
                });
                self.terminate()
            }
            Phase::Streaming => {
                self.send(Message {
                    to: self.reply_to.clone().unwrap_or_default(),
                    from: Some(self.path.clone()),
                    error: Some(error),
                    ..Default::default()
                });
                self.terminate()
            }
            Phase::Terminated => self.released(),
        }
    }

    /// A route handler returned an error after (or instead of)
    /// replying. Best effort: if nothing terminal went out yet, the
    /// requester gets a 500.
    pub fn handler_failed(&mut self, message: String) -> bool {
        debug!(path = %self.path, %message, "route handler failed");
        self.destroy(Value::String(message))
    }

    /// Replay buffered upload items to the handler's reader. Returns
    /// true when both sides already finished.
    pub fn activate(&mut self) -> bool {
        if let Some(consumer) = &mut self.upload {
            consumer.activate();
        }
        self.released()
    }

    /// Handler dropped its upload reader mid-body. Remaining sink
    /// traffic is discarded.
    pub fn cancel_upload(&mut self) -> bool {
        self.upload = None;
        self.released()
    }

    pub fn connection_lost(&mut self) {
        if let Some(consumer) = &mut self.upload {
            consumer.activate();
            consumer.push(StreamEvent::ConnectionLost);
        }
        if self.phase != Phase::Terminated {
            self.phase = Phase::Terminated;
            let _ = self.events.send(ResponderEvent::ConnectionLost);
            let _ = self.events.send(ResponderEvent::Closed);
        }
    }

    /// Requester-initiated abort. No reply is sent; `Aborted` is
    /// delivered strictly before `Closed`.
    fn abort(&mut self, error: Option<Value>) -> bool {
        if self.phase == Phase::Terminated {
            return self.released();
        }
        if let Some(error) = &error {
            debug!(path = %self.path, %error, "exchange aborted with payload");
        }
        self.aborted = true;
        if let Some(consumer) = &mut self.upload {
            if !consumer.is_finished() {
                consumer.push(StreamEvent::Error(
                    error.unwrap_or(Value::String("aborted".to_string())),
                ));
            }
        }
        let _ = self.events.send(ResponderEvent::Aborted);
        self.terminate()
    }

    fn terminate(&mut self) -> bool {
        self.phase = Phase::Terminated;
        let _ = self.events.send(ResponderEvent::Closed);
        self.released()
    }

    /// The handler-table entry is released only once the exchange is
    /// terminal and any upload consumer has drained through to its
    /// reader. Released entries drop stray traffic instead of losing
    /// queued items.
    fn released(&self) -> bool {
        if self.phase != Phase::Terminated {
            return false;
        }
        match &self.upload {
            None => true,
            Some(consumer) => consumer.is_active() && consumer.is_finished(),
        }
    }

    fn closed_error(&self) -> ResponderError {
        if self.aborted {
            ResponderError::Aborted
        } else {
            ResponderError::Closed
        }
    }

    fn send(&self, msg: Message) {
        if self.reply_to.is_some() {
            let _ = self.out.send(msg);
        } else {
            debug!(path = %self.path, "reply suppressed, request carried no reply path");
        }
    }

    fn send_item(&self, body: Body) {
        self.send(Message {
            to: self.reply_to.clone().unwrap_or_default(),
            from: Some(self.path.clone()),
            data: body.data,
            chunk: body.chunk,
            ..Default::default()
        });
    }
}

/// An inbound request as seen by a route handler.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Target path the requester addressed
    pub path: String,
    /// Requester's reply path, absent for fire-and-forget requests
    pub from: Option<String>,
    pub data: Option<Value>,
    pub chunk: Option<Bytes>,
    /// Upload body stream, present for streaming requests
    pub body: Option<BodyStream>,
}

/// Handle a route handler uses to answer its request.
///
/// Consuming methods (`send`, `fail`, `end`, `destroy`) terminate the
/// exchange; `write` upgrades it to a streaming reply.
pub struct Responder {
    path: String,
    cmd: mpsc::UnboundedSender<Command>,
    status: u16,
    events: Option<ResponderEvents>,
}

impl Responder {
    pub(crate) fn new(
        path: String,
        cmd: mpsc::UnboundedSender<Command>,
        events: ResponderEvents,
    ) -> Self {
        Self {
            path,
            cmd,
            status: 0,
            events: Some(events),
        }
    }

    /// Detaches the lifecycle event receiver, once.
    pub fn take_events(&mut self) -> Option<ResponderEvents> {
        self.events.take()
    }

    /// Sets the status for the terminal reply. Defaults to 200.
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    fn effective_status(&self) -> u16 {
        if self.status == 0 {
            200
        } else {
            self.status
        }
    }

    async fn ack(
        &self,
        make: impl FnOnce(RAck) -> Command,
    ) -> Result<(), ResponderError> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd
            .send(make(ack))
            .map_err(|_| ResponderError::PeerClosed)?;
        ack_rx.await.map_err(|_| ResponderError::PeerClosed)?
    }

    /// One-shot reply carrying `body` under the configured status.
    pub async fn send(self, body: Body) -> Result<(), ResponderError> {
        let status = self.effective_status();
        let path = self.path.clone();
        self.ack(|ack| Command::Respond {
            path,
            status,
            body,
            error: None,
            ack,
        })
        .await
    }

    /// One-shot failure reply. The payload travels in the error
    /// segment; the status defaults to 500 unless set.
    pub async fn fail(self, error: Value) -> Result<(), ResponderError> {
        let status = if self.status == 0 { 500 } else { self.status };
        let path = self.path.clone();
        self.ack(|ack| Command::Respond {
            path,
            status,
            body: Body::default(),
            error: Some(error),
            ack,
        })
        .await
    }

    /// Streaming write. The first call announces the source stream.
    pub async fn write(&mut self, body: Body) -> Result<(), ResponderError> {
        let path = self.path.clone();
        self.ack(|ack| Command::SourceWrite { path, body, ack }).await
    }

    /// Ends the reply. With no prior writes this is a one-shot status
    /// reply; mid-stream, an optional final body rides the terminator.
    pub async fn end(self, body: Option<Body>) -> Result<(), ResponderError> {
        let status = self.effective_status();
        let path = self.path.clone();
        self.ack(|ack| Command::SourceEnd {
            path,
            status,
            body,
            ack,
        })
        .await
    }

    /// Errors the exchange without a status reply once streaming.
    pub fn destroy(self, error: Value) {
        let _ = self.cmd.send(Command::Destroy {
            path: self.path,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture(
        upload: bool,
    ) -> (
        ResponderExchange,
        ResponderEvents,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let consumer = upload.then(|| BufferedConsumer::new().0);
        let (exchange, events) = ResponderExchange::new(
            "/job/#streams/me/1".to_string(),
            Some("/#requests/other/1".to_string()),
            out_tx,
            consumer,
        );
        (exchange, events, out_rx)
    }

    fn reply_ack() -> (RAck, oneshot::Receiver<Result<(), ResponderError>>) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn test_upload_exchange_announces_sink_on_construction() {
        let (_exchange, _events, mut out_rx) = fixture(true);
        let msg = out_rx.try_recv().unwrap();
        assert_eq!(msg.to, "/#requests/other/1");
        assert_eq!(msg.status, Some(100));
        assert_eq!(
            msg.stream.unwrap().sink.as_deref(),
            Some("/job/#streams/me/1")
        );
    }

    #[tokio::test]
    async fn test_one_shot_reply_terminates() {
        let (mut exchange, mut events, mut out_rx) = fixture(false);
        let (ack, ack_rx) = reply_ack();
        assert!(exchange.respond(200, Body::data(json!("done")), None, ack));
        ack_rx.await.unwrap().unwrap();

        let msg = out_rx.try_recv().unwrap();
        assert_eq!(msg.status, Some(200));
        assert_eq!(msg.data, Some(json!("done")));
        assert_eq!(events.next().await, Some(ResponderEvent::Closed));
    }

    #[tokio::test]
    async fn test_second_reply_is_rejected() {
        let (mut exchange, _events, _out_rx) = fixture(false);
        let (ack, _ack_rx) = reply_ack();
        exchange.respond(200, Body::default(), None, ack);

        let (ack, ack_rx) = reply_ack();
        assert!(exchange.respond(200, Body::default(), None, ack));
        assert_eq!(ack_rx.await.unwrap().unwrap_err(), ResponderError::Closed);
    }

    #[tokio::test]
    async fn test_first_write_upgrades_to_source_stream() {
        let (mut exchange, _events, mut out_rx) = fixture(false);
        let (ack, _ack_rx) = reply_ack();
        assert!(!exchange.source_write(Body::data(json!("a")), ack));

        let announce = out_rx.try_recv().unwrap();
        assert_eq!(announce.status, Some(100));
        assert_eq!(
            announce.stream.unwrap().source.as_deref(),
            Some("/job/#streams/me/1")
        );

        let item = out_rx.try_recv().unwrap();
        assert_eq!(item.data, Some(json!("a")));
        assert_eq!(item.from.as_deref(), Some("/job/#streams/me/1"));
    }

    #[tokio::test]
    async fn test_end_with_body_piggybacks_eof() {
        let (mut exchange, _events, mut out_rx) = fixture(false);
        let (ack, _ack_rx) = reply_ack();
        exchange.source_write(Body::data(json!("a")), ack);
        out_rx.try_recv().unwrap();
        out_rx.try_recv().unwrap();

        let (ack, _ack_rx) = reply_ack();
        assert!(exchange.source_end(200, Some(Body::data(json!("last"))), ack));

        let msg = out_rx.try_recv().unwrap();
        assert_eq!(msg.error, Some(Value::Null));
        assert_eq!(msg.data, Some(json!("last")));
    }

    #[tokio::test]
    async fn test_end_without_writes_is_one_shot_status() {
        let (mut exchange, _events, mut out_rx) = fixture(false);
        let (ack, _ack_rx) = reply_ack();
        assert!(exchange.source_end(204, None, ack));

        let msg = out_rx.try_recv().unwrap();
        assert_eq!(msg.status, Some(204));
        assert!(msg.stream.is_none());
    }

    #[tokio::test]
    async fn test_abort_emits_aborted_then_closed_without_reply() {
        let (mut exchange, mut events, mut out_rx) = fixture(false);
        let delete = Message {
            to: "/job/#streams/me/1".to_string(),
            from: Some("/#requests/other/1".to_string()),
            method: Some(Method::Delete),
            ..Default::default()
        };
        assert!(exchange.handle_message(delete));

        assert_eq!(events.next().await, Some(ResponderEvent::Aborted));
        assert_eq!(events.next().await, Some(ResponderEvent::Closed));
        // no message goes out in reaction to an abort
        assert!(out_rx.try_recv().is_err());

        let (ack, ack_rx) = reply_ack();
        exchange.respond(200, Body::default(), None, ack);
        assert_eq!(ack_rx.await.unwrap().unwrap_err(), ResponderError::Aborted);
    }

    #[tokio::test]
    async fn test_destroy_mid_stream_sends_error_terminator() {
        let (mut exchange, mut events, mut out_rx) = fixture(false);
        let (ack, _ack_rx) = reply_ack();
        exchange.source_write(Body::data(json!("a")), ack);
        out_rx.try_recv().unwrap();
        out_rx.try_recv().unwrap();

        assert!(exchange.destroy(json!({"message": "boom"})));
        let msg = out_rx.try_recv().unwrap();
        assert_eq!(msg.error, Some(json!({"message": "boom"})));
        assert!(msg.status.is_none());
        assert_eq!(events.next().await, Some(ResponderEvent::Closed));
    }

    #[tokio::test]
    async fn test_closed_is_emitted_exactly_once() {
        let (mut exchange, mut events, _out_rx) = fixture(false);
        let (ack, _ack_rx) = reply_ack();
        exchange.respond(200, Body::default(), None, ack);
        exchange.destroy(json!("late"));
        exchange.connection_lost();

        assert_eq!(events.next().await, Some(ResponderEvent::Closed));
        drop(exchange);
        assert_eq!(events.next().await, None);
    }
}
