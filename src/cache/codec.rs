//! Activation codec: lossy quantization of saved activations.
//!
//! The controller only depends on the [`Codec`] trait. [`GroupQuantizer`] is
//! the reference implementation: elements are split into fixed-size groups,
//! each group is mapped onto `2^bits - 1` uniform levels between its min and
//! max, and the level indices are bit-packed into one byte buffer.
//!
//! The packed buffer is the part that migrates between device and host; the
//! per-group parameters are small and stay resident.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::tensor::{Tensor, TensorError};

/// Bit widths the reference codec can pack.
pub const SUPPORTED_BITS: [u8; 4] = [1, 2, 4, 8];

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unsupported bit width {0} (expected one of 1, 2, 4, 8)")]
    UnsupportedBits(u8),

    #[error("Payload encodes {encoded} elements but shape {shape:?} needs {expected}")]
    ShapeMismatch {
        shape: Vec<usize>,
        encoded: usize,
        expected: usize,
    },

    #[error("Packed buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Group size must be non-zero")]
    ZeroGroupSize,

    #[error("{groups} groups need parameters but only {mins} mins and {steps} steps are present")]
    MissingGroupParams {
        groups: usize,
        mins: usize,
        steps: usize,
    },

    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Per-group quantization parameters that stay resident on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub bits: u8,
    pub group_size: usize,
    pub numel: usize,
    pub mins: Vec<f32>,
    pub steps: Vec<f32>,
}

/// The output of [`Codec::compress`].
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    /// Bit-packed level indices (the migratable part).
    pub data: Bytes,
    pub params: Arc<QuantParams>,
}

impl CompressedPayload {
    pub fn packed_len(&self) -> usize {
        self.data.len()
    }
}

/// Compression codec supplied to the controller.
pub trait Codec: Send + Sync {
    fn compress(&self, tensor: &Tensor, bits: u8) -> Result<CompressedPayload, CodecError>;

    fn decompress(
        &self,
        payload: &CompressedPayload,
        shape: &[usize],
    ) -> Result<Tensor, CodecError>;
}

/// Group-wise min/step quantizer with bit packing.
#[derive(Debug, Clone)]
pub struct GroupQuantizer {
    group_size: usize,
}

impl GroupQuantizer {
    pub fn new(group_size: usize) -> Result<Self, CodecError> {
        if group_size == 0 {
            return Err(CodecError::ZeroGroupSize);
        }
        Ok(Self { group_size })
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Worst-case absolute reconstruction error for values spanning `range`.
    pub fn error_bound(range: f32, bits: u8) -> f32 {
        let levels = ((1u32 << bits) - 1) as f32;
        range / (2.0 * levels)
    }

    fn packed_len(numel: usize, bits: u8) -> usize {
        (numel * bits as usize).div_ceil(8)
    }
}

impl Default for GroupQuantizer {
    fn default() -> Self {
        Self { group_size: 256 }
    }
}

impl Codec for GroupQuantizer {
    fn compress(&self, tensor: &Tensor, bits: u8) -> Result<CompressedPayload, CodecError> {
        if !SUPPORTED_BITS.contains(&bits) {
            return Err(CodecError::UnsupportedBits(bits));
        }
        let data = tensor.data();
        let levels = ((1u32 << bits) - 1) as f32;
        let per_byte = 8 / bits as usize;

        let groups = data.len().div_ceil(self.group_size);
        let mut mins = Vec::with_capacity(groups);
        let mut steps = Vec::with_capacity(groups);
        let mut packed = BytesMut::zeroed(Self::packed_len(data.len(), bits));

        for (g, chunk) in data.chunks(self.group_size).enumerate() {
            let (lo, hi) = chunk
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let step = (hi - lo) / levels;
            mins.push(lo);
            steps.push(step);

            for (j, &v) in chunk.iter().enumerate() {
                let q = if step > 0.0 {
                    ((v - lo) / step).round().clamp(0.0, levels) as u8
                } else {
                    0
                };
                let idx = g * self.group_size + j;
                let shift = (idx % per_byte) * bits as usize;
                packed[idx / per_byte] |= q << shift;
            }
        }

        Ok(CompressedPayload {
            data: packed.freeze(),
            params: Arc::new(QuantParams {
                bits,
                group_size: self.group_size,
                numel: data.len(),
                mins,
                steps,
            }),
        })
    }

    fn decompress(
        &self,
        payload: &CompressedPayload,
        shape: &[usize],
    ) -> Result<Tensor, CodecError> {
        let params = &payload.params;
        if !SUPPORTED_BITS.contains(&params.bits) {
            return Err(CodecError::UnsupportedBits(params.bits));
        }
        if params.group_size == 0 {
            return Err(CodecError::ZeroGroupSize);
        }
        let groups = params.numel.div_ceil(params.group_size);
        if params.mins.len() < groups || params.steps.len() < groups {
            return Err(CodecError::MissingGroupParams {
                groups,
                mins: params.mins.len(),
                steps: params.steps.len(),
            });
        }
        let expected: usize = shape.iter().product();
        if expected != params.numel {
            return Err(CodecError::ShapeMismatch {
                shape: shape.to_vec(),
                encoded: params.numel,
                expected,
            });
        }
        let needed = Self::packed_len(params.numel, params.bits);
        if payload.data.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                available: payload.data.len(),
            });
        }

        let bits = params.bits as usize;
        let per_byte = 8 / bits;
        let mask = ((1u16 << bits) - 1) as u8;
        let values = (0..params.numel)
            .map(|idx| {
                let g = idx / params.group_size;
                let q = (payload.data[idx / per_byte] >> ((idx % per_byte) * bits)) & mask;
                params.mins[g] + q as f32 * params.steps[g]
            })
            .collect();

        Ok(Tensor::from_vec(values, shape.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Tensor {
        Tensor::from_fn(vec![n], |i| (i as f32 * 0.37).sin() * 3.0)
    }

    #[test]
    fn test_packed_size_shrinks_with_bits() {
        let codec = GroupQuantizer::default();
        let t = ramp(1024);

        let p8 = codec.compress(&t, 8).unwrap();
        let p2 = codec.compress(&t, 2).unwrap();
        assert_eq!(p8.packed_len(), 1024);
        assert_eq!(p2.packed_len(), 256);
        assert_eq!(p8.params.mins.len(), 4);
    }

    #[test]
    fn test_error_within_bound() {
        let codec = GroupQuantizer::new(64).unwrap();
        let t = ramp(500);
        let (lo, hi) = t.min_max().unwrap();

        for bits in SUPPORTED_BITS {
            let payload = codec.compress(&t, bits).unwrap();
            let out = codec.decompress(&payload, &[500]).unwrap();
            let err = out.max_abs_diff(&t).unwrap();
            assert!(err <= GroupQuantizer::error_bound(hi - lo, bits) + 1e-5, "bits={bits} err={err}");
        }
    }

    #[test]
    fn test_constant_group_is_exact() {
        let codec = GroupQuantizer::default();
        let t = Tensor::from_vec(vec![2.5; 300], vec![3, 100]).unwrap();
        let payload = codec.compress(&t, 4).unwrap();
        let out = codec.decompress(&payload, &[3, 100]).unwrap();
        assert_eq!(out.data(), t.data());
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let codec = GroupQuantizer::default();
        let t = ramp(16);
        assert!(matches!(codec.compress(&t, 3), Err(CodecError::UnsupportedBits(3))));

        let payload = codec.compress(&t, 8).unwrap();
        assert!(matches!(
            codec.decompress(&payload, &[4, 5]),
            Err(CodecError::ShapeMismatch { .. })
        ));

        let truncated = CompressedPayload {
            data: payload.data.slice(..4),
            params: payload.params.clone(),
        };
        assert!(matches!(
            codec.decompress(&truncated, &[16]),
            Err(CodecError::Truncated { needed: 16, available: 4 })
        ));
    }

    #[test]
    fn test_rejects_inconsistent_params() {
        let codec = GroupQuantizer::new(4).unwrap();
        let payload = codec.compress(&ramp(16), 4).unwrap();
        let with_params = |params: QuantParams| CompressedPayload {
            data: payload.data.clone(),
            params: Arc::new(params),
        };

        let mut zero_bits = (*payload.params).clone();
        zero_bits.bits = 0;
        assert!(matches!(
            codec.decompress(&with_params(zero_bits), &[16]),
            Err(CodecError::UnsupportedBits(0))
        ));

        let mut zero_group = (*payload.params).clone();
        zero_group.group_size = 0;
        assert!(matches!(
            codec.decompress(&with_params(zero_group), &[16]),
            Err(CodecError::ZeroGroupSize)
        ));

        let mut short = (*payload.params).clone();
        short.mins.truncate(2);
        assert!(matches!(
            codec.decompress(&with_params(short), &[16]),
            Err(CodecError::MissingGroupParams {
                groups: 4,
                mins: 2,
                steps: 4
            })
        ));

        assert!(matches!(GroupQuantizer::new(0), Err(CodecError::ZeroGroupSize)));
    }
}
