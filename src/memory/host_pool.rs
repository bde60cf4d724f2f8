//! Pinned host memory allocator for offloaded payloads.
//!
//! Swap-out and swap-in copies are only asynchronous when the host side is
//! page-locked, so every host buffer comes from an allocator that can hand
//! out pinned memory. [`PinnedHostPool`] enforces a byte budget: a buffer
//! holds a lease on its bytes and returns them when dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::memory::buffer::HostBuffer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("Out of host memory: requested {requested} bytes, {available} available")]
    OutOfHostMemory { requested: usize, available: usize },
}

/// Source of host buffers for swap-out.
pub trait HostAllocator: Send + Sync {
    fn allocate(&self, len: usize, pinned: bool) -> Result<HostBuffer, AllocError>;
}

#[derive(Debug)]
struct PoolState {
    budget: usize,
    used: AtomicUsize,
    allocations: AtomicU64,
}

/// Bytes reserved from a pool, released on drop.
#[derive(Debug)]
pub struct HostLease {
    state: Arc<PoolState>,
    len: usize,
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.state.used.fetch_sub(self.len, Ordering::AcqRel);
    }
}

/// Budgeted host allocator.
#[derive(Debug, Clone)]
pub struct PinnedHostPool {
    state: Arc<PoolState>,
}

impl PinnedHostPool {
    pub fn new(budget: usize) -> Self {
        Self {
            state: Arc::new(PoolState {
                budget,
                used: AtomicUsize::new(0),
                allocations: AtomicU64::new(0),
            }),
        }
    }

    /// Bytes currently leased out.
    pub fn used(&self) -> usize {
        self.state.used.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.state.budget.saturating_sub(self.used())
    }

    pub fn budget(&self) -> usize {
        self.state.budget
    }

    /// Total successful allocations since creation.
    pub fn allocations(&self) -> u64 {
        self.state.allocations.load(Ordering::Relaxed)
    }

    fn reserve(&self, len: usize) -> Result<HostLease, AllocError> {
        let budget = self.state.budget;
        self.state
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|&next| next <= budget)
            })
            .map_err(|used| AllocError::OutOfHostMemory {
                requested: len,
                available: budget.saturating_sub(used),
            })?;
        Ok(HostLease {
            state: self.state.clone(),
            len,
        })
    }
}

impl HostAllocator for PinnedHostPool {
    fn allocate(&self, len: usize, pinned: bool) -> Result<HostBuffer, AllocError> {
        let lease = self.reserve(len)?;
        self.state.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(len, pinned, used = self.used(), "Allocated host buffer");
        Ok(HostBuffer::new(len, pinned, lease))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_enforced_and_released() {
        let pool = PinnedHostPool::new(4096);

        let a = pool.allocate(3000, true).unwrap();
        assert_eq!(pool.used(), 3000);

        let err = pool.allocate(2000, true).unwrap_err();
        assert_eq!(
            err,
            AllocError::OutOfHostMemory {
                requested: 2000,
                available: 1096
            }
        );

        drop(a);
        assert_eq!(pool.used(), 0);
        pool.allocate(2000, true).unwrap();
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn test_clones_share_budget() {
        let pool = PinnedHostPool::new(100);
        let other = pool.clone();
        let _buf = other.allocate(60, false).unwrap();
        assert_eq!(pool.available(), 40);
    }
}
