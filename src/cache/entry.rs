//! Cache entries and payload residency.
//!
//! An entry owns one compressed payload and counts the outstanding
//! references to it. Its residency records where the packed bytes live and
//! whether a copy is in flight. Only the transfer scheduler moves an entry
//! between residency states.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::codec::QuantParams;
use crate::cache::sequencer::SlotId;
use crate::memory::buffer::{DeviceBuffer, HostBuffer};
use crate::transfer::event::PendingCopy;
use crate::transfer::TransferError;

/// Where an entry's packed payload currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResidencyState {
    OnDevice,
    MigratingToHost,
    OnHost,
    MigratingToDevice,
}

impl std::fmt::Display for ResidencyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResidencyState::OnDevice => write!(f, "on-device"),
            ResidencyState::MigratingToHost => write!(f, "migrating-to-host"),
            ResidencyState::OnHost => write!(f, "on-host"),
            ResidencyState::MigratingToDevice => write!(f, "migrating-to-device"),
        }
    }
}

/// Packed payload together with the buffer that currently holds it.
#[derive(Debug)]
pub enum Residency {
    OnDevice(DeviceBuffer),
    MigratingToHost(PendingCopy<HostBuffer>),
    OnHost(HostBuffer),
    MigratingToDevice(PendingCopy<DeviceBuffer>),
}

impl Residency {
    pub fn state(&self) -> ResidencyState {
        match self {
            Residency::OnDevice(_) => ResidencyState::OnDevice,
            Residency::MigratingToHost(_) => ResidencyState::MigratingToHost,
            Residency::OnHost(_) => ResidencyState::OnHost,
            Residency::MigratingToDevice(_) => ResidencyState::MigratingToDevice,
        }
    }

    /// Size of the packed payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Residency::OnDevice(buf) => buf.len(),
            Residency::MigratingToHost(pending) => pending.len(),
            Residency::OnHost(buf) => buf.len(),
            Residency::MigratingToDevice(pending) => pending.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold in copies that have already completed, without blocking.
    pub fn poll(&mut self) -> Result<(), TransferError> {
        match self {
            Residency::MigratingToHost(pending) => {
                if let Some(host) = pending.try_take()? {
                    *self = Residency::OnHost(host);
                }
            }
            Residency::MigratingToDevice(pending) => {
                if let Some(device) = pending.try_take()? {
                    *self = Residency::OnDevice(device);
                }
            }
            Residency::OnDevice(_) | Residency::OnHost(_) => {}
        }
        Ok(())
    }
}

/// One deduplicated, reference-counted compressed activation.
#[derive(Debug)]
pub struct CacheEntry {
    pub(crate) residency: Residency,
    pub(crate) params: Arc<QuantParams>,
    pub(crate) refcount: u32,
    /// Slot of the save that created the entry.
    pub(crate) first_slot: SlotId,
}

impl CacheEntry {
    pub fn new(residency: Residency, params: Arc<QuantParams>, first_slot: SlotId) -> Self {
        Self {
            residency,
            params,
            refcount: 1,
            first_slot,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn state(&self) -> ResidencyState {
        self.residency.state()
    }

    pub fn first_slot(&self) -> SlotId {
        self.first_slot
    }

    pub fn packed_len(&self) -> usize {
        self.residency.len()
    }

    /// Add a reference from a repeated save.
    pub(crate) fn retain(&mut self) -> u32 {
        self.refcount += 1;
        self.refcount
    }

    /// Drop a reference. Returns the remaining count.
    pub(crate) fn release(&mut self) -> u32 {
        self.refcount = self.refcount.saturating_sub(1);
        self.refcount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::event::Event;
    use crate::transfer::QueueKind;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    fn params() -> Arc<QuantParams> {
        Arc::new(QuantParams {
            bits: 8,
            group_size: 4,
            numel: 4,
            mins: vec![0.0],
            steps: vec![1.0],
        })
    }

    #[test]
    fn test_refcount_retain_release() {
        let buf = DeviceBuffer::new(Bytes::from_static(&[0, 1, 2, 3]));
        let mut entry = CacheEntry::new(Residency::OnDevice(buf), params(), 0);
        assert_eq!(entry.refcount(), 1);
        assert_eq!(entry.retain(), 2);
        assert_eq!(entry.release(), 1);
        assert_eq!(entry.release(), 0);
        assert_eq!(entry.state(), ResidencyState::OnDevice);
        assert_eq!(entry.packed_len(), 4);
    }

    #[test]
    fn test_poll_completes_device_migration() {
        let (tx, rx) = oneshot::channel();
        let mut residency = Residency::MigratingToDevice(PendingCopy::new(
            rx,
            Event::completed(),
            QueueKind::SwapIn,
            2,
        ));

        residency.poll().unwrap();
        assert_eq!(residency.state(), ResidencyState::MigratingToDevice);

        tx.send(DeviceBuffer::new(Bytes::from_static(&[9, 9]))).unwrap();
        residency.poll().unwrap();
        assert_eq!(residency.state(), ResidencyState::OnDevice);
        assert_eq!(residency.len(), 2);
    }
}
