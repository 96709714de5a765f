//! Ordering-preserving buffered stream consumer
//!
//! A stream handle is typically handed to caller code one tick after
//! the owning exchange starts receiving data. Pushing straight into a
//! consumer that is not listening yet would either drop early events
//! or reorder them relative to an early error, so pushes made before
//! activation are queued verbatim and replayed in arrival order.

use std::collections::VecDeque;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use pathmux_proto::Body;

use crate::peer::Command;

/// One event of a streamed sequence, in wire arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Item(Body),
    End,
    Error(Value),
    ConnectionLost,
}

impl StreamEvent {
    /// End, error, and connection loss all close the sequence.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Item(_))
    }
}

/// Stream consumption errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("stream failed: {0}")]
    Remote(Value),

    #[error("connection lost")]
    ConnectionLost,
}

/// Push side of a streamed sequence.
///
/// Events pushed before [`activate`](Self::activate) are queued;
/// activation is idempotent and replays the queue in order, stopping
/// at (and delivering) the first terminal event. Anything queued after
/// a terminal event is discarded, since an error or end is always a
/// stream's true terminal event. Once active, pushes bypass the queue.
#[derive(Debug)]
pub struct BufferedConsumer {
    tx: mpsc::UnboundedSender<StreamEvent>,
    queue: Option<VecDeque<StreamEvent>>,
    finished: bool,
}

impl BufferedConsumer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                queue: Some(VecDeque::new()),
                finished: false,
            },
            rx,
        )
    }

    pub fn push(&mut self, event: StreamEvent) {
        if self.finished {
            return;
        }
        match &mut self.queue {
            Some(queue) => queue.push_back(event),
            None => {
                let terminal = event.is_terminal();
                let _ = self.tx.send(event);
                self.finished = terminal;
            }
        }
    }

    pub fn activate(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        for event in queue {
            let terminal = event.is_terminal();
            let _ = self.tx.send(event);
            if terminal {
                self.finished = true;
                break;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.queue.is_none()
    }

    /// True once a terminal event has been delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Pull side of a streamed sequence: a finite, non-restartable ordered
/// sequence of body items. The first [`next`](Self::next) activates
/// the exchange's buffered consumer.
#[derive(Debug)]
pub struct BodyStream {
    path: String,
    cmd: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    activated: bool,
    done: bool,
}

impl BodyStream {
    pub(crate) fn new(
        path: String,
        cmd: mpsc::UnboundedSender<Command>,
        rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self {
            path,
            cmd,
            rx,
            activated: false,
            done: false,
        }
    }

    /// Next item, `None` after the end marker. An error closes the
    /// sequence; later calls return `None`.
    pub async fn next(&mut self) -> Option<Result<Body, StreamError>> {
        if self.done {
            return None;
        }
        if !self.activated {
            self.activated = true;
            let _ = self.cmd.send(Command::Activate {
                path: self.path.clone(),
            });
        }
        match self.rx.recv().await {
            Some(StreamEvent::Item(body)) => Some(Ok(body)),
            Some(StreamEvent::End) | None => {
                self.done = true;
                None
            }
            Some(StreamEvent::Error(error)) => {
                self.done = true;
                Some(Err(StreamError::Remote(error)))
            }
            Some(StreamEvent::ConnectionLost) => {
                self.done = true;
                Some(Err(StreamError::ConnectionLost))
            }
        }
    }

    /// Drain the remaining items into a vector.
    pub async fn collect(mut self) -> Result<Vec<Body>, StreamError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Cancel the stream. For a download this asks the responder to
    /// abort its source; no further items are yielded locally.
    pub fn cancel(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let _ = self.cmd.send(Command::CancelStream {
            path: self.path.clone(),
        });
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        // an undrained stream still releases its exchange slot
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_replay_preserves_order_and_stops_at_error() {
        let (mut consumer, mut rx) = BufferedConsumer::new();
        consumer.push(StreamEvent::Item(Body::data(json!("A"))));
        consumer.push(StreamEvent::Item(Body::data(json!("B"))));
        consumer.push(StreamEvent::Error(json!({"message": "E"})));
        // anything queued after the terminal event is discarded
        consumer.push(StreamEvent::Item(Body::data(json!("late"))));

        consumer.activate();

        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Item(Body::data(json!("A")))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Item(Body::data(json!("B")))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Error(json!({"message": "E"}))
        );
        assert!(rx.try_recv().is_err());
        assert!(consumer.is_finished());
    }

    #[test]
    fn test_activation_is_idempotent() {
        let (mut consumer, mut rx) = BufferedConsumer::new();
        consumer.push(StreamEvent::Item(Body::data(json!(1))));
        consumer.activate();
        consumer.activate();
        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Item(Body::data(json!(1)))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pushes_after_activation_bypass_queue() {
        let (mut consumer, mut rx) = BufferedConsumer::new();
        consumer.activate();
        consumer.push(StreamEvent::Item(Body::data(json!("x"))));
        consumer.push(StreamEvent::End);
        consumer.push(StreamEvent::Item(Body::data(json!("after end"))));

        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Item(Body::data(json!("x")))
        );
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::End);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_end_during_replay_discards_rest() {
        let (mut consumer, mut rx) = BufferedConsumer::new();
        consumer.push(StreamEvent::Item(Body::data(json!("a"))));
        consumer.push(StreamEvent::End);
        consumer.push(StreamEvent::Item(Body::data(json!("b"))));
        consumer.activate();

        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::Item(Body::data(json!("a")))
        );
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::End);
        assert!(rx.try_recv().is_err());
    }
}
