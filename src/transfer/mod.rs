//! Asynchronous data movement between device and host.
//!
//! - [`event`]: Completion events used as cross-queue fences
//! - [`stream`]: In-order execution queues (compute, swap-out, swap-in)
//! - [`scheduler`]: Issues swap-out, swap-in and prefetch copies

pub mod event;
pub mod scheduler;
pub mod stream;

use thiserror::Error;

use crate::cache::entry::ResidencyState;
use crate::memory::host_pool::AllocError;

/// Identifies one of the execution queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Queue running the producing computation (compression).
    Compute,
    /// Device → host copies.
    SwapOut,
    /// Host → device copies.
    SwapIn,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Compute => write!(f, "compute"),
            QueueKind::SwapOut => write!(f, "swap-out"),
            QueueKind::SwapIn => write!(f, "swap-in"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Host buffer allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("The {0} queue has shut down")]
    QueueClosed(QueueKind),

    #[error("A copy on the {0} queue was dropped before completing")]
    CopyAborted(QueueKind),

    #[error("Transfer queues need a running tokio runtime")]
    NoRuntime,

    #[error("Payload is {0} after a device migration was requested")]
    UnexpectedResidency(ResidencyState),
}
