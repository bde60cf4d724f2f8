//! In-order execution queues.
//!
//! Each [`StreamQueue`] is a tokio task that runs submitted jobs one at a
//! time, in submission order, the way an accelerator stream does. A job can
//! carry events from other queues that must be recorded before it starts;
//! the queue records a completion event after the job finishes. Nothing about
//! ordering *across* queues is implied by submission order.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transfer::event::{Event, EventRecorder};
use crate::transfer::{QueueKind, TransferError};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedJob {
    waits: Vec<Event>,
    job: Job,
    done: EventRecorder,
}

/// Counters shared between a queue handle and its worker.
#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
}

/// Handle to one execution queue.
pub struct StreamQueue {
    kind: QueueKind,
    tx: mpsc::UnboundedSender<QueuedJob>,
    counters: Arc<QueueCounters>,
}

impl StreamQueue {
    /// Spawn the queue worker on the current tokio runtime.
    pub fn spawn(kind: QueueKind) -> Result<Self, TransferError> {
        let handle = Handle::try_current().map_err(|_| TransferError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(QueueCounters::default());
        handle.spawn(run_queue(kind, rx, counters.clone()));
        debug!(queue = %kind, "Spawned execution queue");
        Ok(Self { kind, tx, counters })
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    /// Enqueue `job` behind everything already submitted to this queue and
    /// behind every event in `waits`. Returns the job's completion event.
    pub fn submit<F>(&self, waits: Vec<Event>, job: F) -> Result<Event, TransferError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, event) = Event::pair();
        self.tx
            .send(QueuedJob {
                waits,
                job: Box::pin(job),
                done,
            })
            .map_err(|_| TransferError::QueueClosed(self.kind))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(event)
    }

    /// Record an event that completes once all work submitted so far is done.
    pub fn record_event(&self) -> Result<Event, TransferError> {
        self.submit(Vec::new(), async {})
    }

    /// Jobs submitted, including event markers.
    pub fn submitted(&self) -> u64 {
        self.counters.submitted.load(Ordering::Relaxed)
    }

    /// Jobs that have finished.
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }
}

async fn run_queue(
    kind: QueueKind,
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    counters: Arc<QueueCounters>,
) {
    while let Some(queued) = rx.recv().await {
        for fence in &queued.waits {
            if !fence.wait().await {
                warn!(queue = %kind, "Fence dropped without being recorded");
            }
        }
        queued.job.await;
        queued.done.record();
        counters.completed.fetch_add(1, Ordering::Relaxed);
    }
    debug!(queue = %kind, "Execution queue drained and closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let queue = StreamQueue::spawn(QueueKind::Compute).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            queue
                .submit(Vec::new(), async move {
                    tokio::task::yield_now().await;
                    log.lock().unwrap().push(i);
                })
                .unwrap();
        }
        assert!(queue.record_event().unwrap().wait().await);

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.submitted(), 6);
        assert_eq!(queue.completed(), 6);
    }

    #[tokio::test]
    async fn test_fence_orders_across_queues() {
        let first = StreamQueue::spawn(QueueKind::SwapOut).unwrap();
        let second = StreamQueue::spawn(QueueKind::SwapIn).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (gate, gate_event) = Event::pair();
        let log_a = log.clone();
        let a_done = first
            .submit(vec![gate_event], async move {
                log_a.lock().unwrap().push("swap-out");
            })
            .unwrap();

        let log_b = log.clone();
        let b_done = second
            .submit(vec![a_done], async move {
                log_b.lock().unwrap().push("swap-in");
            })
            .unwrap();

        tokio::task::yield_now().await;
        assert!(log.lock().unwrap().is_empty());

        gate.record();
        assert!(b_done.wait().await);
        assert_eq!(*log.lock().unwrap(), vec!["swap-out", "swap-in"]);
    }

    #[test]
    fn test_spawn_needs_runtime() {
        assert!(matches!(
            StreamQueue::spawn(QueueKind::SwapIn),
            Err(TransferError::NoRuntime)
        ));
    }
}
