use thiserror::Error;
use tokio::sync::mpsc;

use crate::frame::OutboundFrame;

/// Errors returned by outbound queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The supervisor that owns the receiving end is gone.
    #[error("outbound queue is closed")]
    Closed,
    /// The queue is at capacity.
    #[error("outbound queue is full")]
    Full,
}

/// Sending side of the supervisor's outbound frame queue.
///
/// Frames wait here while the session is not connected and are written to the
/// connection in order once it is. The receiver outlives individual
/// connections, so queued frames survive `stop`/`run` cycles.
#[derive(Clone, Debug)]
pub struct OutboundQueue {
    tx: mpsc::Sender<OutboundFrame>,
}

impl OutboundQueue {
    /// Create a queue and return it with its receiver.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Queue one frame, waiting for room if the queue is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.tx.send(frame).await.map_err(|_| QueueError::Closed)
    }

    /// Queue one frame without waiting.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Free slots left.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}
