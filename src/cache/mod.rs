//! Compressed activation cache.
//!
//! - [`filter`]: Eligibility filter (which tensors get compressed)
//! - [`identity`]: Cache keys fingerprinting a tensor within one step
//! - [`sequencer`]: Per-step slot ids and the slot → key record
//! - [`entry`]: Refcounted entries and payload residency
//! - [`codec`]: Codec trait and the group quantizer
//! - [`prefetcher`]: Previous-slot lookahead for restores
//! - [`controller`]: The controller tying it all together

pub mod codec;
pub mod controller;
pub mod entry;
pub mod filter;
pub mod identity;
pub mod prefetcher;
pub mod sequencer;
