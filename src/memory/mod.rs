//! Device and host memory for compressed payloads.
//!
//! - [`buffer`]: Device and host buffer types moved by the transfer queues
//! - [`host_pool`]: Pinned host allocator with a byte budget

pub mod buffer;
pub mod host_pool;
