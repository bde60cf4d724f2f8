//! act-cache: compressed activation cache for neural-network training.
//!
//! Saved activations are quantized once per training step, shared between
//! repeated saves of the same value, optionally parked in host memory, and
//! brought back (with previous-slot prefetch) when the backward pass needs
//! them:
//!   save → filter → fingerprint → slot → cache (→ swap-out)
//!   restore → cache → swap-in (+ prefetch) → decompress → release

pub mod cache;
pub mod config;
pub mod memory;
pub mod metrics;
pub mod simulation;
pub mod tensor;
pub mod transfer;

pub use cache::controller::{CacheController, CacheError, CacheStats, SavedActivation};
pub use config::Config;
pub use tensor::Tensor;
