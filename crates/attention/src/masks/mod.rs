//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32` shaped
//! `[batch, 1, q_len, k_len]`. Values are either `0.0` (keep) or
//! `f32::NEG_INFINITY` (discard), matching Candle's softmax-friendly masking.

pub mod causal;
pub mod segment;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
pub use segment::build_segment_mask;

/// Sums additive masks; a position survives only if every mask keeps it.
pub fn combine_masks(first: &Tensor, second: Option<&Tensor>) -> Result<Tensor> {
    match second {
        Some(second) => first.broadcast_add(second),
        None => Ok(first.clone()),
    }
}

#[cfg(test)]
mod tests;
