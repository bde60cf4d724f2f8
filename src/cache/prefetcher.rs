//! Prefetch planning for restores.
//!
//! Backward passes usually restore activations in the reverse order they
//! were saved, so while slot `n` is being restored the payload saved at slot
//! `n - 1` is the next one needed. The prefetcher names that payload so its
//! swap-in can overlap with the computation that consumes slot `n`.
//!
//! The lookahead is strictly "the slot immediately preceding in call order".
//! It assumes saves happen in execution order; with branching or reordered
//! call sequences the predicted slot may not be the next restore.

use crate::cache::controller::CacheError;
use crate::cache::identity::CacheKey;
use crate::cache::sequencer::{IterationSequencer, SlotId};

/// A speculative swap-in of the entry saved at `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub slot: SlotId,
    pub key: CacheKey,
}

/// Decides which entry to prefetch on each restore.
#[derive(Debug, Clone)]
pub struct Prefetcher {
    enabled: bool,
}

impl Prefetcher {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Plan the lookahead for a restore of `slot`.
    ///
    /// Slot 0 has nothing before it. Any other slot must have a recorded
    /// predecessor; a gap means saves and restores are out of step.
    pub fn plan(
        &self,
        sequencer: &IterationSequencer,
        slot: SlotId,
    ) -> Result<Option<PrefetchRequest>, CacheError> {
        if !self.enabled || slot == 0 {
            return Ok(None);
        }
        let prev = slot - 1;
        let key = sequencer
            .previous_key(slot)
            .ok_or(CacheError::MissingSlot {
                slot: prev,
                restoring: slot,
            })?;
        Ok(Some(PrefetchRequest { slot: prev, key }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(address: usize) -> CacheKey {
        CacheKey {
            address,
            checksum: 1,
            version: 0,
        }
    }

    #[test]
    fn test_plans_previous_slot() {
        let mut seq = IterationSequencer::new();
        for addr in [100, 200] {
            let id = seq.next_slot();
            seq.record_slot(id, key(addr));
        }
        let prefetcher = Prefetcher::new(true);

        assert_eq!(prefetcher.plan(&seq, 0).unwrap(), None);
        assert_eq!(
            prefetcher.plan(&seq, 1).unwrap(),
            Some(PrefetchRequest {
                slot: 0,
                key: key(100)
            })
        );
    }

    #[test]
    fn test_disabled_plans_nothing() {
        let mut seq = IterationSequencer::new();
        let id = seq.next_slot();
        seq.record_slot(id, key(1));
        assert_eq!(Prefetcher::new(false).plan(&seq, 1).unwrap(), None);
    }

    #[test]
    fn test_missing_predecessor_is_an_error() {
        let seq = IterationSequencer::new();
        let err = Prefetcher::new(true).plan(&seq, 3).unwrap_err();
        assert!(matches!(
            err,
            CacheError::MissingSlot {
                slot: 2,
                restoring: 3
            }
        ));
    }
}
