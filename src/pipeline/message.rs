// Copyright (c) Contributors to the tpm2-abrm project.
// Licensed under the MIT License.

//! Messages flowing through the bounded queues that connect pipeline
//! stages. Two orthogonal streams, commands and control events, share one
//! queue per hop as a tagged union of `Tpm2Command` and connection-state
//! events.

use crate::command::Tpm2Command;
use crate::response::Tpm2Response;

/// A message enqueued from the Command Source to the Resource Manager.
pub enum InboundMessage {
    Command(Tpm2Command),
    ConnectionRemoved(u64),
    CheckCancel,
}

/// A message enqueued from the Resource Manager to the Response Sink.
pub enum OutboundMessage {
    Response {
        connection_id: u64,
        response: Tpm2Response,
    },
    CheckCancel,
}

/// Failure to enqueue a message. `std::sync::mpsc` senders only fail once
/// every receiver has been dropped, i.e. the stage has already shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("the receiving pipeline stage has shut down")]
    Closed,
}

/// A destination a pipeline stage enqueues messages into. Producers never
/// block: `std::sync::mpsc::Sender` satisfies this directly.
pub trait Sink<T>: Send + Sync {
    fn enqueue(&self, message: T) -> Result<(), SinkError>;
}

impl<T: Send> Sink<T> for std::sync::mpsc::Sender<T> {
    fn enqueue(&self, message: T) -> Result<(), SinkError> {
        self.send(message).map_err(|_| SinkError::Closed)
    }
}

/// A long-lived pipeline stage that owns a thread for its lifetime. Plain
/// composition rather than inheritance: each stage is a concrete struct
/// implementing this.
pub trait Runnable {
    /// Run the stage's event loop until cancelled. Takes `self` by value
    /// since a stage is moved into its owning thread.
    fn run(self);
}
