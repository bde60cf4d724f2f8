//! Tensor handles as seen by the activation cache.
//!
//! A handle carries everything the controller needs to reason about a value
//! without owning the model: a stable storage address, shape, element type,
//! the gradient-tracking flag and a mutation-version counter. Element data is
//! shared behind an `Arc`, so cloning a handle is cheap and clones observe
//! the same storage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage address of a tensor (stand-in for a device pointer).
pub type Address = usize;

/// Allocation granularity for synthetic addresses, in bytes.
const ADDRESS_ALIGN: usize = 256;

/// Global bump allocator for storage addresses.
static NEXT_ADDRESS: AtomicUsize = AtomicUsize::new(ADDRESS_ALIGN);

fn allocate_address(len_bytes: usize) -> Address {
    let span = len_bytes.max(1).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
    NEXT_ADDRESS.fetch_add(span, Ordering::Relaxed)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TensorError {
    #[error("Shape {shape:?} holds {expected} elements but {actual} were supplied")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    Bf16,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::Bf16 => 2,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::Bf16 => write!(f, "bf16"),
        }
    }
}

/// A handle to a tensor value.
#[derive(Debug, Clone)]
pub struct Tensor {
    address: Address,
    shape: Vec<usize>,
    dtype: DType,
    requires_grad: bool,
    version: u64,
    data: Arc<Vec<f32>>,
}

impl Tensor {
    /// Build an f32 tensor from row-major data.
    pub fn from_vec(data: Vec<f32>, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::with_dtype(data, shape, DType::F32)
    }

    /// Build a half-precision tensor. Values are widened for storage but the
    /// handle keeps reporting `DType::F16`.
    pub fn from_f16(data: &[f16], shape: Vec<usize>) -> Result<Self, TensorError> {
        let widened = data.iter().map(|v| v.to_f32()).collect();
        Self::with_dtype(widened, shape, DType::F16)
    }

    /// Build a bfloat16 tensor.
    pub fn from_bf16(data: &[bf16], shape: Vec<usize>) -> Result<Self, TensorError> {
        let widened = data.iter().map(|v| v.to_f32()).collect();
        Self::with_dtype(widened, shape, DType::Bf16)
    }

    /// Build an f32 tensor whose element `i` is `f(i)`.
    pub fn from_fn(shape: Vec<usize>, f: impl FnMut(usize) -> f32) -> Self {
        let numel = shape.iter().product();
        let data: Vec<f32> = (0..numel).map(f).collect();
        let address = allocate_address(numel * DType::F32.size_bytes());
        Self {
            address,
            shape,
            dtype: DType::F32,
            requires_grad: false,
            version: 0,
            data: Arc::new(data),
        }
    }

    fn with_dtype(data: Vec<f32>, shape: Vec<usize>, dtype: DType) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ShapeMismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        let address = allocate_address(expected * dtype.size_bytes());
        Ok(Self {
            address,
            shape,
            dtype,
            requires_grad: false,
            version: 0,
            data: Arc::new(data),
        })
    }

    /// Set the gradient-tracking flag.
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Mutate the tensor in place: the address is kept and the version bumped.
    ///
    /// Other handles sharing the storage keep the old contents.
    pub fn apply_inplace(&mut self, f: impl FnOnce(&mut [f32])) {
        f(Arc::make_mut(&mut self.data).as_mut_slice());
        self.version += 1;
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Size of the tensor in its declared element type.
    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_bytes()
    }

    /// Sum of all elements, accumulated in f64.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    /// Whether two handles refer to the same underlying storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Largest element-wise absolute difference. `None` if shapes differ.
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f32> {
        if self.shape != other.shape {
            return None;
        }
        Some(
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }

    /// Smallest and largest element, or `None` for an empty tensor.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data.iter().fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_rejected() {
        let err = Tensor::from_vec(vec![1.0; 5], vec![2, 3]).unwrap_err();
        assert_eq!(
            err,
            TensorError::ShapeMismatch {
                shape: vec![2, 3],
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn test_addresses_are_distinct() {
        let a = Tensor::from_vec(vec![0.0; 4], vec![4]).unwrap();
        let b = Tensor::from_vec(vec![0.0; 4], vec![4]).unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(a.clone().address(), a.address());
    }

    #[test]
    fn test_inplace_bumps_version_and_keeps_address() {
        let mut t = Tensor::from_vec(vec![1.0, 2.0], vec![2]).unwrap();
        let before = t.clone();
        t.apply_inplace(|d| d[0] = 5.0);

        assert_eq!(t.version(), 1);
        assert_eq!(t.address(), before.address());
        assert_eq!(before.data(), &[1.0, 2.0]);
        assert_eq!(t.data(), &[5.0, 2.0]);
        assert!(!t.shares_storage(&before));
    }

    #[test]
    fn test_half_tensors_report_dtype() {
        let data = [f16::from_f32(1.5), f16::from_f32(-2.0)];
        let t = Tensor::from_f16(&data, vec![2]).unwrap();
        assert_eq!(t.dtype(), DType::F16);
        assert_eq!(t.data(), &[1.5, -2.0]);
        assert_eq!(t.size_bytes(), 4);

        let b = Tensor::from_bf16(&[bf16::from_f32(3.0)], vec![1]).unwrap();
        assert_eq!(b.dtype(), DType::Bf16);
    }

    #[test]
    fn test_sum_and_diff() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], vec![3]).unwrap();
        let b = Tensor::from_vec(vec![1.0, 2.5, 3.0], vec![3]).unwrap();
        assert_eq!(a.sum(), 6.0);
        assert_eq!(a.max_abs_diff(&b), Some(0.5));
        assert_eq!(a.min_max(), Some((1.0, 3.0)));
    }
}
