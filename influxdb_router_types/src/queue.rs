//! The bounded queue between the HTTP frontend and the forwarding stage.
//!
//! Any number of request handlers enqueue through cloned [`IncomingQueue`] handles, a single
//! [`QueueConsumer`] dequeues. Enqueueing never waits: once the queue holds `capacity`
//! batches further attempts fail with [`EnqueueError::Full`] and the batch is handed back to
//! the caller. Entries already queued are never evicted.
use std::num::NonZeroUsize;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::Batch;

/// Default number of batches the incoming queue can hold
pub const DEFAULT_QUEUE_CAPACITY: usize = 500_000;

/// Largest capacity the underlying channel can track
pub const MAX_QUEUE_CAPACITY: usize = usize::MAX >> 3;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("incoming queue is full")]
    Full(Batch),

    #[error("incoming queue consumer has shut down")]
    Closed(Batch),
}

impl EnqueueError {
    /// Recover the batch that could not be enqueued
    pub fn into_batch(self) -> Batch {
        match self {
            Self::Full(b) | Self::Closed(b) => b,
        }
    }
}

/// Create a queue holding at most `capacity` batches
///
/// Capacities above [`MAX_QUEUE_CAPACITY`] are clamped to it.
pub fn incoming_queue(capacity: NonZeroUsize) -> (IncomingQueue, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity.get().min(MAX_QUEUE_CAPACITY));
    (IncomingQueue { tx }, QueueConsumer { rx })
}

/// Producer side of the queue, cheap to clone
#[derive(Debug, Clone)]
pub struct IncomingQueue {
    tx: mpsc::Sender<Batch>,
}

impl IncomingQueue {
    /// Append `batch` at the tail of the queue without waiting for space
    pub fn try_enqueue(&self, batch: Batch) -> Result<(), EnqueueError> {
        self.tx.try_send(batch).map_err(|e| match e {
            mpsc::error::TrySendError::Full(b) => EnqueueError::Full(b),
            mpsc::error::TrySendError::Closed(b) => EnqueueError::Closed(b),
        })
    }

    /// Number of batches waiting to be consumed
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the queue, batches come out in the order they were enqueued
#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::Receiver<Batch>,
}

impl QueueConsumer {
    /// Wait for the next batch, `None` once every producer handle has been dropped and the
    /// queue is empty
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }

    /// Take the next batch if one is immediately available
    pub fn try_recv(&mut self) -> Option<Batch> {
        self.rx.try_recv().ok()
    }

    /// Refuse further batches, the ones already queued can still be taken
    pub fn close(&mut self) {
        self.rx.close();
    }
}
