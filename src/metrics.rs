//! Prometheus metrics for the activation cache.
//!
//! Each controller owns its own registry so several controllers (and tests)
//! never collide on metric names.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Save outcomes, used as the `outcome` label.
pub const OUTCOME_STORED: &str = "stored";
pub const OUTCOME_DEDUPLICATED: &str = "deduplicated";
pub const OUTCOME_PASSTHROUGH: &str = "passthrough";
pub const OUTCOME_BYPASS: &str = "bypass";

/// Transfer directions, used as the `direction` label.
pub const DIRECTION_TO_HOST: &str = "to_host";
pub const DIRECTION_TO_DEVICE: &str = "to_device";

/// Counters updated by the transfer scheduler.
#[derive(Clone)]
pub struct TransferMetrics {
    pub transfers: IntCounterVec,
    pub transfer_bytes: IntCounterVec,
    pub prefetch_requests: IntCounter,
    pub prefetch_issued: IntCounter,
}

impl TransferMetrics {
    pub fn record_transfer(&self, direction: &str, bytes: usize) {
        self.transfers.with_label_values(&[direction]).inc();
        self.transfer_bytes
            .with_label_values(&[direction])
            .inc_by(bytes as u64);
    }

    pub fn transfer_count(&self, direction: &str) -> u64 {
        self.transfers.with_label_values(&[direction]).get()
    }

    pub fn transfer_bytes(&self, direction: &str) -> u64 {
        self.transfer_bytes.with_label_values(&[direction]).get()
    }
}

/// All metrics of one controller.
pub struct CacheMetrics {
    registry: Registry,
    pub saves: IntCounterVec,
    pub restores: IntCounter,
    pub destroyed: IntCounter,
    pub live_entries: IntGauge,
    pub steps: IntCounter,
    pub transfer: TransferMetrics,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let saves = IntCounterVec::new(
            Opts::new("act_cache_saves_total", "Save calls by outcome"),
            &["outcome"],
        )?;
        let restores = IntCounter::new("act_cache_restores_total", "Restore calls")?;
        let destroyed = IntCounter::new(
            "act_cache_entries_destroyed_total",
            "Entries destroyed when their refcount reached zero",
        )?;
        let live_entries = IntGauge::new("act_cache_live_entries", "Entries currently cached")?;
        let steps = IntCounter::new("act_cache_steps_total", "Completed training steps")?;
        let transfers = IntCounterVec::new(
            Opts::new("act_cache_transfers_total", "Copies issued by direction"),
            &["direction"],
        )?;
        let transfer_bytes = IntCounterVec::new(
            Opts::new("act_cache_transfer_bytes_total", "Bytes copied by direction"),
            &["direction"],
        )?;
        let prefetch_requests = IntCounter::new(
            "act_cache_prefetch_requests_total",
            "Speculative swap-in requests",
        )?;
        let prefetch_issued = IntCounter::new(
            "act_cache_prefetch_issued_total",
            "Speculative requests that started a copy",
        )?;

        registry.register(Box::new(saves.clone()))?;
        registry.register(Box::new(restores.clone()))?;
        registry.register(Box::new(destroyed.clone()))?;
        registry.register(Box::new(live_entries.clone()))?;
        registry.register(Box::new(steps.clone()))?;
        registry.register(Box::new(transfers.clone()))?;
        registry.register(Box::new(transfer_bytes.clone()))?;
        registry.register(Box::new(prefetch_requests.clone()))?;
        registry.register(Box::new(prefetch_issued.clone()))?;

        Ok(Self {
            registry,
            saves,
            restores,
            destroyed,
            live_entries,
            steps,
            transfer: TransferMetrics {
                transfers,
                transfer_bytes,
                prefetch_requests,
                prefetch_issued,
            },
        })
    }

    pub fn record_save(&self, outcome: &str) {
        self.saves.with_label_values(&[outcome]).inc();
    }

    pub fn save_count(&self, outcome: &str) -> u64 {
        self.saves.with_label_values(&[outcome]).get()
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
