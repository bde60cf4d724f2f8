//! Completion events and pending copies.
//!
//! An [`Event`] is recorded by a queue once every job submitted before it has
//! finished. Jobs on another queue can be made to wait on it, which is how a
//! swap-out is fenced behind the compression that produced its source, and
//! how a swap-in is fenced behind a swap-out still in flight.

use tokio::sync::{oneshot, watch};

use crate::transfer::{QueueKind, TransferError};

/// Write side of an [`Event`].
#[derive(Debug)]
pub struct EventRecorder {
    tx: watch::Sender<bool>,
}

impl EventRecorder {
    /// Mark the event complete.
    pub fn record(self) {
        // Receivers may all be gone; nothing is waiting then.
        let _ = self.tx.send(true);
    }
}

/// Completion event that can be queried or awaited any number of times.
#[derive(Debug, Clone)]
pub struct Event {
    rx: watch::Receiver<bool>,
}

impl Event {
    /// Create an event together with the handle that records it.
    pub fn pair() -> (EventRecorder, Event) {
        let (tx, rx) = watch::channel(false);
        (EventRecorder { tx }, Event { rx })
    }

    /// An event that is already complete.
    pub fn completed() -> Event {
        let (recorder, event) = Self::pair();
        recorder.record();
        event
    }

    /// Non-blocking completion query.
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the event is recorded. Returns `false` if the recorder was
    /// dropped without recording, which only happens when the owning queue
    /// shut down mid-job.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        let recorded = rx.wait_for(|done| *done).await.is_ok();
        recorded
    }
}

/// The result of a copy that may still be in flight.
#[derive(Debug)]
pub struct PendingCopy<T> {
    rx: oneshot::Receiver<T>,
    done: Event,
    queue: QueueKind,
    len: usize,
}

impl<T> PendingCopy<T> {
    pub fn new(rx: oneshot::Receiver<T>, done: Event, queue: QueueKind, len: usize) -> Self {
        Self {
            rx,
            done,
            queue,
            len,
        }
    }

    /// Event recorded by the copying queue once this copy has finished.
    pub fn done_event(&self) -> &Event {
        &self.done
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Take the result if the copy has completed, without blocking.
    pub fn try_take(&mut self) -> Result<Option<T>, TransferError> {
        match self.rx.try_recv() {
            Ok(value) => Ok(Some(value)),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(TransferError::CopyAborted(self.queue)),
        }
    }

    /// Wait for the copy to complete and take its result.
    ///
    /// Once this has returned, the result is gone: later calls to
    /// [`try_take`](Self::try_take) report the copy as aborted.
    pub async fn wait(&mut self) -> Result<T, TransferError> {
        let queue = self.queue;
        (&mut self.rx)
            .await
            .map_err(|_| TransferError::CopyAborted(queue))
    }
}
