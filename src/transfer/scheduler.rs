//! Transfer scheduler: moves packed payloads between device and host.
//!
//! Owns the three execution queues. Copies never rely on submission order
//! across queues:
//! - a swap-out waits on an event recorded on the compute queue after the
//!   payload was produced;
//! - a swap-in of a payload still being swapped out waits on that swap-out's
//!   completion event;
//! - a restore waits on the swap-in result itself before reading the bytes.
//!
//! The source buffer of every copy is moved into the copy job and dropped
//! there, so it cannot be released or reused before the copy has finished.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::entry::Residency;
use crate::memory::buffer::{DeviceBuffer, HostBuffer};
use crate::memory::host_pool::HostAllocator;
use crate::metrics::{TransferMetrics, DIRECTION_TO_DEVICE, DIRECTION_TO_HOST};
use crate::transfer::event::{Event, PendingCopy};
use crate::transfer::stream::StreamQueue;
use crate::transfer::{QueueKind, TransferError};

/// Why a device migration was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationReason {
    /// A restore needs the payload now.
    Demand,
    /// Speculative lookahead; never waited on by the requester.
    Prefetch,
}

/// Snapshot of transfer activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferStats {
    pub swap_out_transfers: u64,
    pub swap_in_transfers: u64,
    pub bytes_to_host: u64,
    pub bytes_to_device: u64,
    pub prefetch_requests: u64,
    pub prefetch_issued: u64,
}

/// Issues asynchronous copies on dedicated queues.
pub struct TransferScheduler {
    compute: StreamQueue,
    swap_out: StreamQueue,
    swap_in: StreamQueue,
    allocator: Arc<dyn HostAllocator>,
    pin_memory: bool,
    metrics: TransferMetrics,
}

impl TransferScheduler {
    /// Spawn the queues on the current tokio runtime.
    pub fn new(
        allocator: Arc<dyn HostAllocator>,
        pin_memory: bool,
        metrics: TransferMetrics,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            compute: StreamQueue::spawn(QueueKind::Compute)?,
            swap_out: StreamQueue::spawn(QueueKind::SwapOut)?,
            swap_in: StreamQueue::spawn(QueueKind::SwapIn)?,
            allocator,
            pin_memory,
            metrics,
        })
    }

    /// Event marking the end of all compute work submitted so far.
    pub fn record_compute(&self) -> Result<Event, TransferError> {
        self.compute.record_event()
    }

    /// Start moving a freshly produced payload to host memory.
    ///
    /// The host buffer is allocated up front so exhaustion surfaces to the
    /// caller immediately. The copy starts once `producer` is recorded.
    pub fn migrate_to_host(
        &mut self,
        buffer: DeviceBuffer,
        producer: Event,
    ) -> Result<Residency, TransferError> {
        let len = buffer.len();
        let mut host = self.allocator.allocate(len, self.pin_memory)?;
        let (tx, rx) = oneshot::channel::<HostBuffer>();

        let done = self.swap_out.submit(vec![producer], async move {
            host.copy_from_device(&buffer);
            drop(buffer);
            // The entry may have been dropped by a step reset; the host
            // buffer is then released here.
            let _ = tx.send(host);
        })?;

        self.metrics.record_transfer(DIRECTION_TO_HOST, len);
        debug!(bytes = len, "Issued swap-out");
        Ok(Residency::MigratingToHost(PendingCopy::new(
            rx,
            done,
            QueueKind::SwapOut,
            len,
        )))
    }

    /// Make sure a payload is on, or on its way to, the device.
    ///
    /// No-op for payloads already on the device or already migrating there.
    /// A payload still being swapped out is chained behind that copy. Never
    /// blocks. Returns whether a copy was issued.
    ///
    /// `residency` always holds a valid state afterwards. If the copy cannot
    /// be queued, the payload is lost with the dropped job and the residency
    /// reports an aborted swap-in.
    pub fn migrate_to_device(
        &mut self,
        residency: &mut Residency,
        reason: MigrationReason,
    ) -> Result<bool, TransferError> {
        if reason == MigrationReason::Prefetch {
            self.metrics.prefetch_requests.inc();
        }
        residency.poll()?;

        let len = residency.len();
        let (tx, rx) = oneshot::channel::<DeviceBuffer>();
        let source = std::mem::replace(residency, Residency::OnDevice(DeviceBuffer::empty()));
        let submitted = match source {
            Residency::OnHost(host) => self.swap_in.submit(Vec::new(), async move {
                let device = DeviceBuffer::from_host(&host);
                drop(host);
                let _ = tx.send(device);
            }),
            Residency::MigratingToHost(mut pending) => {
                let fence = pending.done_event().clone();
                self.swap_in.submit(vec![fence], async move {
                    // Dropping `tx` on failure surfaces as an aborted copy.
                    if let Ok(host) = pending.wait().await {
                        let device = DeviceBuffer::from_host(&host);
                        drop(host);
                        let _ = tx.send(device);
                    }
                })
            }
            settled => {
                *residency = settled;
                return Ok(false);
            }
        };

        let done = match submitted {
            Ok(done) => done,
            Err(err) => {
                *residency = Residency::MigratingToDevice(PendingCopy::new(
                    rx,
                    Event::completed(),
                    QueueKind::SwapIn,
                    len,
                ));
                return Err(err);
            }
        };
        *residency =
            Residency::MigratingToDevice(PendingCopy::new(rx, done, QueueKind::SwapIn, len));

        self.metrics.record_transfer(DIRECTION_TO_DEVICE, len);
        if reason == MigrationReason::Prefetch {
            self.metrics.prefetch_issued.inc();
        }
        debug!(bytes = len, ?reason, "Issued swap-in");
        Ok(true)
    }

    /// Bring a payload onto the device and wait until it is readable.
    ///
    /// On success `residency` is `OnDevice` and a handle to the same bytes is
    /// returned. On failure it is left in its last observed state.
    pub async fn wait_on_device(
        &mut self,
        residency: &mut Residency,
    ) -> Result<DeviceBuffer, TransferError> {
        self.migrate_to_device(residency, MigrationReason::Demand)?;
        let buffer = match residency {
            Residency::OnDevice(buffer) => buffer.clone(),
            Residency::MigratingToDevice(pending) => pending.wait().await?,
            other => return Err(TransferError::UnexpectedResidency(other.state())),
        };
        *residency = Residency::OnDevice(buffer.clone());
        Ok(buffer)
    }

    /// Wait until every queue has finished the work submitted so far.
    pub async fn synchronize(&self) -> Result<(), TransferError> {
        let queues = [&self.compute, &self.swap_out, &self.swap_in];
        let mut events = Vec::with_capacity(queues.len());
        for queue in queues {
            events.push((queue.kind(), queue.record_event()?));
        }
        let results = join_all(events.iter().map(|(_, event)| event.wait())).await;
        for ((kind, _), recorded) in events.iter().zip(results) {
            if !recorded {
                return Err(TransferError::QueueClosed(*kind));
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            swap_out_transfers: self.metrics.transfer_count(DIRECTION_TO_HOST),
            swap_in_transfers: self.metrics.transfer_count(DIRECTION_TO_DEVICE),
            bytes_to_host: self.metrics.transfer_bytes(DIRECTION_TO_HOST),
            bytes_to_device: self.metrics.transfer_bytes(DIRECTION_TO_DEVICE),
            prefetch_requests: self.metrics.prefetch_requests.get(),
            prefetch_issued: self.metrics.prefetch_issued.get(),
        }
    }
}
