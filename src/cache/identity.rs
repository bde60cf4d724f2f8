//! Identity resolver: fingerprints a tensor instance within one step.

use serde::{Deserialize, Serialize};

use crate::tensor::{Address, Tensor};

/// Identifies a saved value for the duration of one training step.
///
/// The checksum is the element sum, stored as the bit pattern of an f64 so
/// the key is `Eq + Hash`. It is a cheap heuristic rather than a content
/// hash: two different values with equal address, sum and version collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub address: Address,
    pub checksum: u64,
    pub version: u64,
}

impl CacheKey {
    /// The checksum as the sum it was computed from.
    pub fn checksum_value(&self) -> f64 {
        f64::from_bits(self.checksum)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#x}/{:.6e}/v{}",
            self.address,
            self.checksum_value(),
            self.version
        )
    }
}

/// Compute the cache key of a tensor.
pub fn fingerprint(tensor: &Tensor) -> CacheKey {
    CacheKey {
        address: tensor.address(),
        checksum: tensor.sum().to_bits(),
        version: tensor.version(),
    }
}
