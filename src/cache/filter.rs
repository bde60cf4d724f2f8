//! Eligibility filter: which saved values are compression candidates.

use std::collections::HashSet;

use crate::tensor::{Address, DType, Tensor};

/// Decides whether a tensor goes through the compression path.
///
/// Only gradient-tracked f32 activations of rank 3 or 4 qualify. Addresses
/// registered as excluded (typically parameters) never do.
#[derive(Debug, Default, Clone)]
pub struct EligibilityFilter {
    excluded: HashSet<Address>,
}

impl EligibilityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses to the excluded set. Registration is additive.
    pub fn register_excluded(&mut self, addresses: impl IntoIterator<Item = Address>) {
        self.excluded.extend(addresses);
    }

    pub fn is_excluded(&self, address: Address) -> bool {
        self.excluded.contains(&address)
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.len()
    }

    pub fn is_candidate(&self, tensor: &Tensor) -> bool {
        tensor.dtype() == DType::F32
            && tensor.requires_grad()
            && matches!(tensor.rank(), 3 | 4)
            && !self.excluded.contains(&tensor.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn activation(shape: Vec<usize>) -> Tensor {
        Tensor::from_fn(shape, |i| i as f32).with_requires_grad(true)
    }

    #[test]
    fn test_rank_and_grad_rules() {
        let filter = EligibilityFilter::new();
        assert!(filter.is_candidate(&activation(vec![2, 3, 4])));
        assert!(filter.is_candidate(&activation(vec![2, 3, 4, 5])));
        assert!(!filter.is_candidate(&activation(vec![6, 4])));
        assert!(!filter.is_candidate(&activation(vec![1, 2, 3, 4, 5])));
        assert!(!filter.is_candidate(&Tensor::from_fn(vec![2, 3, 4], |_| 0.0)));
    }

    #[test]
    fn test_half_precision_is_not_candidate() {
        let filter = EligibilityFilter::new();
        let data = vec![f16::ONE; 24];
        let t = Tensor::from_f16(&data, vec![2, 3, 4])
            .unwrap()
            .with_requires_grad(true);
        assert!(!filter.is_candidate(&t));
    }

    #[test]
    fn test_excluded_addresses() {
        let mut filter = EligibilityFilter::new();
        let weight = activation(vec![4, 4, 3, 3]);
        let other = activation(vec![4, 4, 3, 3]);

        filter.register_excluded([weight.address()]);
        filter.register_excluded(std::iter::empty());
        assert!(!filter.is_candidate(&weight));
        assert!(filter.is_candidate(&other));
        assert_eq!(filter.excluded_count(), 1);
    }
}
