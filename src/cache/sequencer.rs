//! Iteration sequencer: per-step slot ids and the slot → key record.

use std::collections::HashMap;

use crate::cache::identity::CacheKey;

/// Position of a save call within one training step.
pub type SlotId = u64;

/// Hands out slot ids in call order and remembers which key each slot
/// produced, so a restore can look up the slot saved just before it.
#[derive(Debug, Default)]
pub struct IterationSequencer {
    next: SlotId,
    slots: HashMap<SlotId, CacheKey>,
}

impl IterationSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next slot id.
    pub fn next_slot(&mut self) -> SlotId {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The id the next call to [`next_slot`](Self::next_slot) will return.
    pub fn peek(&self) -> SlotId {
        self.next
    }

    pub fn record_slot(&mut self, id: SlotId, key: CacheKey) {
        self.slots.insert(id, key);
    }

    pub fn key_at(&self, id: SlotId) -> Option<CacheKey> {
        self.slots.get(&id).copied()
    }

    /// Key recorded for the slot immediately preceding `id` in call order.
    pub fn previous_key(&self, id: SlotId) -> Option<CacheKey> {
        id.checked_sub(1).and_then(|prev| self.key_at(prev))
    }

    pub fn recorded(&self) -> usize {
        self.slots.len()
    }

    /// Forget every slot and restart numbering at 0.
    pub fn reset(&mut self) {
        self.next = 0;
        self.slots.clear();
    }
}
