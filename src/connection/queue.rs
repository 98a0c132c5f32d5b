//! Queuing of outbound messages while disconnected, and tracking of
//! messages awaiting acknowledgement.

use crate::error::ErrorInfo;
use crate::protocol::ProtocolMessage;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Completion signal for a published message.
pub type Completion = oneshot::Sender<Result<(), ErrorInfo>>;

/// An outbound message together with its optional completion signal.
#[derive(Debug)]
pub struct QueuedMessage {
    pub message: ProtocolMessage,
    pub completion: Option<Completion>,
}

impl QueuedMessage {
    pub fn new(message: ProtocolMessage, completion: Option<Completion>) -> Self {
        Self {
            message,
            completion,
        }
    }

    /// Resolve the completion, if the caller kept one.
    pub fn complete(&mut self, result: Result<(), ErrorInfo>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// FIFO queue of messages awaiting a usable connection.
///
/// Messages are drained exactly once, in the order they were queued, when
/// the connection becomes Connected.
#[derive(Debug, Default)]
pub struct MessageQueue {
    queued: Vec<QueuedMessage>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: QueuedMessage) {
        self.queued.push(message);
    }

    /// Put messages back at the head of the queue, ahead of anything queued
    /// later. Used for unacknowledged messages when the transport drops.
    pub fn requeue(&mut self, messages: Vec<QueuedMessage>) {
        let mut rest = std::mem::replace(&mut self.queued, messages);
        self.queued.append(&mut rest);
    }

    /// Take every queued message, preserving queue order.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        std::mem::take(&mut self.queued)
    }

    /// Fail every queued message with the given error.
    pub fn fail_all(&mut self, error: &ErrorInfo) {
        for mut queued in self.queued.drain(..) {
            queued.complete(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

/// Messages sent to the service and awaiting ACK or NACK, keyed by their
/// message serial.
///
/// ACK and NACK frames carry a starting serial and a count covering that
/// many consecutive serials. Serials the map does not hold are skipped, so
/// a duplicate ACK after a resume is harmless.
#[derive(Debug, Default)]
pub struct PendingAcks {
    pending: BTreeMap<i64, QueuedMessage>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, serial: i64, message: QueuedMessage) {
        self.pending.insert(serial, message);
    }

    /// Acknowledge `count` messages starting at `serial`.
    pub fn complete(&mut self, serial: i64, count: u32) {
        for s in serial..serial + count as i64 {
            if let Some(mut queued) = self.pending.remove(&s) {
                queued.complete(Ok(()));
            }
        }
    }

    /// Reject `count` messages starting at `serial`.
    pub fn fail(&mut self, serial: i64, count: u32, error: &ErrorInfo) {
        for s in serial..serial + count as i64 {
            if let Some(mut queued) = self.pending.remove(&s) {
                queued.complete(Err(error.clone()));
            }
        }
    }

    /// Take every pending message in serial order, without completing them.
    /// Used to put unacknowledged messages back at the head of the queue
    /// when the transport drops.
    pub fn take_all(&mut self) -> Vec<QueuedMessage> {
        std::mem::take(&mut self.pending)
            .into_values()
            .collect()
    }

    /// Fail every pending message with the given error.
    pub fn fail_all(&mut self, error: &ErrorInfo) {
        for (_, mut queued) in std::mem::take(&mut self.pending) {
            queued.complete(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
