//! The activation cache controller.
//!
//! The controller is the object the training instrumentation talks to. Every
//! saved activation goes through [`CacheController::save`], which hands back
//! a [`SavedActivation`]; the matching [`CacheController::restore`]
//! reconstructs the value during the backward pass. In between, the
//! controller:
//! - passes ineligible values through untouched;
//! - compresses each distinct activation once per step and shares the payload
//!   between repeated saves (refcounted);
//! - optionally parks payloads in host memory and brings them back on
//!   restore, prefetching the previously saved slot;
//! - drops everything at the step boundary.
//!
//! The controller is not thread-safe and is meant to be driven by one
//! sequential training loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::codec::{Codec, CodecError, CompressedPayload, GroupQuantizer};
use crate::cache::entry::{CacheEntry, Residency, ResidencyState};
use crate::cache::filter::EligibilityFilter;
use crate::cache::identity::{fingerprint, CacheKey};
use crate::cache::prefetcher::Prefetcher;
use crate::cache::sequencer::{IterationSequencer, SlotId};
use crate::config::{Config, ControllerConfig};
use crate::memory::buffer::DeviceBuffer;
use crate::memory::host_pool::{HostAllocator, PinnedHostPool};
use crate::metrics::{
    CacheMetrics, OUTCOME_BYPASS, OUTCOME_DEDUPLICATED, OUTCOME_PASSTHROUGH, OUTCOME_STORED,
};
use crate::tensor::{Address, Tensor};
use crate::transfer::scheduler::{MigrationReason, TransferScheduler, TransferStats};
use crate::transfer::TransferError;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("No cache entry for key {key} (slot {slot}): save/restore calls are not paired")]
    MissingEntry { key: CacheKey, slot: SlotId },

    #[error("No key recorded for slot {slot} while restoring slot {restoring}")]
    MissingSlot { slot: SlotId, restoring: SlotId },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Handle returned by [`CacheController::save`] and consumed by
/// [`CacheController::restore`].
#[derive(Debug, Clone)]
pub enum SavedActivation {
    /// Ineligible value, kept as is.
    Passthrough(Tensor),
    /// Bypass mode: a private payload with no cache entry behind it.
    Detached {
        payload: CompressedPayload,
        shape: Vec<usize>,
    },
    /// A reference to a shared cache entry.
    Cached {
        key: CacheKey,
        shape: Vec<usize>,
        slot: SlotId,
    },
}

impl SavedActivation {
    pub fn key(&self) -> Option<CacheKey> {
        match self {
            SavedActivation::Cached { key, .. } => Some(*key),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<SlotId> {
        match self {
            SavedActivation::Cached { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, SavedActivation::Passthrough(_))
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub step: u64,
    pub live_entries: usize,
    pub next_slot: SlotId,
    pub on_device: usize,
    pub migrating_to_host: usize,
    pub on_host: usize,
    pub migrating_to_device: usize,
    pub saves_stored: u64,
    pub saves_deduplicated: u64,
    pub saves_passthrough: u64,
    pub saves_bypass: u64,
    pub restores: u64,
    pub destroyed: u64,
    pub transfers: TransferStats,
}

/// Compression cache for saved activations.
pub struct CacheController {
    config: ControllerConfig,
    filter: EligibilityFilter,
    sequencer: IterationSequencer,
    prefetcher: Prefetcher,
    entries: HashMap<CacheKey, CacheEntry>,
    scheduler: TransferScheduler,
    codec: Arc<dyn Codec>,
    metrics: CacheMetrics,
    step: u64,
}

impl CacheController {
    /// Build a controller with the reference codec and host pool described
    /// by `config`. Must be called inside a tokio runtime.
    pub fn new(config: &Config) -> Result<Self, CacheError> {
        let codec = Arc::new(GroupQuantizer::new(config.codec.group_size)?);
        let pool = Arc::new(PinnedHostPool::new(config.transfer.host_budget_bytes));
        Self::with_parts(
            config.controller.clone(),
            codec,
            pool,
            config.transfer.pin_host_memory,
        )
    }

    /// Build a controller around a caller-supplied codec and host allocator.
    pub fn with_parts(
        config: ControllerConfig,
        codec: Arc<dyn Codec>,
        allocator: Arc<dyn HostAllocator>,
        pin_host_memory: bool,
    ) -> Result<Self, CacheError> {
        let metrics = CacheMetrics::new()?;
        let scheduler =
            TransferScheduler::new(allocator, pin_host_memory, metrics.transfer.clone())?;
        if config.prefetch && !config.offload_to_host {
            warn!("Prefetch has no effect without host offload");
        }
        let prefetcher = Prefetcher::new(config.prefetch && config.offload_to_host);

        info!(
            bits = config.bits,
            offload = config.offload_to_host,
            prefetch = prefetcher.is_enabled(),
            bypass = config.bypass,
            "Activation cache ready"
        );

        Ok(Self {
            config,
            filter: EligibilityFilter::new(),
            sequencer: IterationSequencer::new(),
            prefetcher,
            entries: HashMap::new(),
            scheduler,
            codec,
            metrics,
            step: 0,
        })
    }

    /// Exclude addresses (e.g. parameters) from compression. Additive.
    pub fn register_excluded(&mut self, addresses: impl IntoIterator<Item = Address>) {
        self.filter.register_excluded(addresses);
        debug!(excluded = self.filter.excluded_count(), "Registered excluded addresses");
    }

    /// Save an activation for a later restore.
    pub fn save(&mut self, tensor: Tensor) -> Result<SavedActivation, CacheError> {
        if self.config.bypass {
            let payload = self.codec.compress(&tensor, self.config.bits)?;
            self.metrics.record_save(OUTCOME_BYPASS);
            return Ok(SavedActivation::Detached {
                payload,
                shape: tensor.shape().to_vec(),
            });
        }

        if !self.filter.is_candidate(&tensor) {
            self.metrics.record_save(OUTCOME_PASSTHROUGH);
            return Ok(SavedActivation::Passthrough(tensor));
        }

        let key = fingerprint(&tensor);
        let slot = self.sequencer.next_slot();
        self.sequencer.record_slot(slot, key);

        if let Some(entry) = self.entries.get_mut(&key) {
            let refcount = entry.retain();
            self.metrics.record_save(OUTCOME_DEDUPLICATED);
            debug!(%key, slot, refcount, "Deduplicated save");
        } else {
            let payload = self.codec.compress(&tensor, self.config.bits)?;
            let buffer = DeviceBuffer::new(payload.data);
            let residency = if self.config.offload_to_host {
                let producer = self.scheduler.record_compute()?;
                self.scheduler.migrate_to_host(buffer, producer)?
            } else {
                Residency::OnDevice(buffer)
            };
            debug!(%key, slot, bytes = residency.len(), "Stored new entry");
            self.entries
                .insert(key, CacheEntry::new(residency, payload.params, slot));
            self.metrics.record_save(OUTCOME_STORED);
            self.metrics.live_entries.set(self.entries.len() as i64);
        }

        Ok(SavedActivation::Cached {
            key,
            shape: tensor.shape().to_vec(),
            slot,
        })
    }

    /// Reconstruct a saved activation.
    pub async fn restore(&mut self, saved: SavedActivation) -> Result<Tensor, CacheError> {
        self.metrics.restores.inc();
        let (key, shape, slot) = match saved {
            SavedActivation::Passthrough(tensor) => return Ok(tensor),
            SavedActivation::Detached { payload, shape } => {
                return Ok(self.codec.decompress(&payload, &shape)?);
            }
            SavedActivation::Cached { key, shape, slot } => (key, shape, slot),
        };

        let entry = lookup(&mut self.entries, &key, slot)?;
        self.scheduler
            .migrate_to_device(&mut entry.residency, MigrationReason::Demand)?;

        if let Some(request) = self.prefetcher.plan(&self.sequencer, slot)? {
            if request.key != key {
                if let Err(err) = self.prefetch(&request.key) {
                    warn!(
                        %err,
                        key = %request.key,
                        slot = request.slot,
                        "Prefetch failed, continuing restore"
                    );
                }
            }
        }

        // Every step below leaves the entry and its refcount untouched on
        // failure; only a successful restore releases a reference.
        let entry = lookup(&mut self.entries, &key, slot)?;
        let buffer = self.scheduler.wait_on_device(&mut entry.residency).await?;
        let payload = CompressedPayload {
            data: buffer.bytes().clone(),
            params: entry.params.clone(),
        };
        let tensor = self.codec.decompress(&payload, &shape)?;

        let remaining = entry.release();
        if remaining == 0 {
            self.entries.remove(&key);
            self.metrics.destroyed.inc();
            debug!(%key, slot, "Destroyed entry");
        } else {
            debug!(%key, slot, refcount = remaining, "Released reference");
        }
        self.metrics.live_entries.set(self.entries.len() as i64);
        Ok(tensor)
    }

    /// Speculatively start bringing an entry back to the device. Returns
    /// whether a copy was issued; entries already on (or headed to) the
    /// device are left untouched.
    pub fn prefetch(&mut self, key: &CacheKey) -> Result<bool, CacheError> {
        let Some(entry) = self.entries.get_mut(key) else {
            debug!(%key, "Prefetch target already released");
            return Ok(false);
        };
        Ok(self
            .scheduler
            .migrate_to_device(&mut entry.residency, MigrationReason::Prefetch)?)
    }

    /// Drop every entry and slot record and restart slot numbering.
    pub fn reset(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                leftover = self.entries.len(),
                step = self.step,
                "Dropping entries that were never fully restored"
            );
        }
        self.entries.clear();
        self.sequencer.reset();
        self.metrics.live_entries.set(0);
    }

    /// Step boundary hook. Call exactly once per training step.
    pub fn end_step(&mut self) {
        self.reset();
        self.metrics.steps.inc();
        info!(step = self.step, "Step finished");
        self.step += 1;
    }

    /// Wait for all issued copies to finish and fold their results in.
    pub async fn synchronize(&mut self) -> Result<(), CacheError> {
        self.scheduler.synchronize().await?;
        for entry in self.entries.values_mut() {
            entry.residency.poll()?;
        }
        Ok(())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn refcount(&self, key: &CacheKey) -> Option<u32> {
        self.entries.get(key).map(CacheEntry::refcount)
    }

    pub fn residency(&self, key: &CacheKey) -> Option<ResidencyState> {
        self.entries.get(key).map(CacheEntry::state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The slot id the next eligible save will receive.
    pub fn next_slot(&self) -> SlotId {
        self.sequencer.peek()
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            step: self.step,
            live_entries: self.entries.len(),
            next_slot: self.sequencer.peek(),
            saves_stored: self.metrics.save_count(OUTCOME_STORED),
            saves_deduplicated: self.metrics.save_count(OUTCOME_DEDUPLICATED),
            saves_passthrough: self.metrics.save_count(OUTCOME_PASSTHROUGH),
            saves_bypass: self.metrics.save_count(OUTCOME_BYPASS),
            restores: self.metrics.restores.get(),
            destroyed: self.metrics.destroyed.get(),
            transfers: self.scheduler.stats(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.state() {
                ResidencyState::OnDevice => stats.on_device += 1,
                ResidencyState::MigratingToHost => stats.migrating_to_host += 1,
                ResidencyState::OnHost => stats.on_host += 1,
                ResidencyState::MigratingToDevice => stats.migrating_to_device += 1,
            }
        }
        stats
    }
}

/// Find the entry a restore refers to. A miss means save and restore calls
/// are out of step.
fn lookup<'a>(
    entries: &'a mut HashMap<CacheKey, CacheEntry>,
    key: &CacheKey,
    slot: SlotId,
) -> Result<&'a mut CacheEntry, CacheError> {
    entries.get_mut(key).ok_or_else(|| {
        error!(%key, slot, "Restore of an unknown entry");
        CacheError::MissingEntry { key: *key, slot }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(offload: bool, prefetch: bool) -> CacheController {
        let mut config = Config::default();
        config.controller.bits = 8;
        config.controller.offload_to_host = offload;
        config.controller.prefetch = prefetch;
        CacheController::new(&config).unwrap()
    }

    fn activation(seed: f32) -> Tensor {
        Tensor::from_fn(vec![2, 3, 4, 4], |i| ((i as f32 + seed) * 0.13).cos())
            .with_requires_grad(true)
    }

    #[tokio::test]
    async fn test_dedup_refcounting() {
        let mut cache = controller(false, false);
        let t = activation(0.0);

        let a = cache.save(t.clone()).unwrap();
        let b = cache.save(t.clone()).unwrap();
        let key = a.key().unwrap();
        assert_eq!(b.key(), Some(key));
        assert_eq!((a.slot(), b.slot()), (Some(0), Some(1)));
        assert_eq!(cache.refcount(&key), Some(2));
        assert_eq!(cache.len(), 1);

        cache.restore(a.clone()).await.unwrap();
        assert_eq!(cache.refcount(&key), Some(1));
        cache.restore(b).await.unwrap();
        assert!(!cache.contains(&key));

        let err = cache.restore(a).await.unwrap_err();
        assert!(matches!(err, CacheError::MissingEntry { slot: 0, .. }));
    }

    #[tokio::test]
    async fn test_offloaded_entry_comes_back() {
        let mut cache = controller(true, false);
        let t = activation(1.0);

        let saved = cache.save(t.clone()).unwrap();
        let key = saved.key().unwrap();
        cache.synchronize().await.unwrap();
        assert_eq!(cache.residency(&key), Some(ResidencyState::OnHost));

        let out = cache.restore(saved).await.unwrap();
        assert!(out.max_abs_diff(&t).unwrap() < 0.01);
        let stats = cache.stats();
        assert_eq!(stats.transfers.swap_out_transfers, 1);
        assert_eq!(stats.transfers.swap_in_transfers, 1);
        assert_eq!(stats.live_entries, 0);
    }

    #[tokio::test]
    async fn test_restore_prefetches_previous_slot() {
        let mut cache = controller(true, true);
        let first = cache.save(activation(2.0)).unwrap();
        let second = cache.save(activation(3.0)).unwrap();
        cache.synchronize().await.unwrap();

        cache.restore(second).await.unwrap();
        let key = first.key().unwrap();
        assert_eq!(cache.stats().transfers.prefetch_issued, 1);
        assert_ne!(cache.residency(&key), Some(ResidencyState::OnHost));

        cache.restore(first).await.unwrap();
        assert_eq!(cache.stats().transfers.swap_in_transfers, 2);
    }

    #[tokio::test]
    async fn test_passthrough_and_stats() {
        let mut cache = controller(false, false);
        let weight = activation(4.0);
        cache.register_excluded([weight.address()]);

        let saved = cache.save(weight.clone()).unwrap();
        assert!(saved.is_passthrough());
        let out = cache.restore(saved).await.unwrap();
        assert!(out.shares_storage(&weight));

        let stats = cache.stats();
        assert_eq!(stats.saves_passthrough, 1);
        assert_eq!(stats.next_slot, 0);
    }
}
