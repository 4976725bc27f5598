//! Segment (document) masks for packed sequences.
//!
//! Segment ids are integer tensors shaped `[batch, len]`. A query may attend to
//! a key only when both carry the same id; id `0` marks padding, which can
//! only see other padding and therefore never leaks into real segments.

use candle_core::{DType, Result, Tensor};

/// Build an additive mask from query and key segment ids.
pub fn build_segment_mask(q_segments: &Tensor, k_segments: &Tensor) -> Result<Tensor> {
    let (batch, q_len) = q_segments.dims2()?;
    let (k_batch, k_len) = k_segments.dims2()?;
    if batch != k_batch {
        candle_core::bail!("segment id batch mismatch: queries {batch}, keys {k_batch}");
    }
    let q = q_segments.to_dtype(DType::I64)?.reshape((batch, 1, q_len, 1))?;
    let k = k_segments.to_dtype(DType::I64)?.reshape((batch, 1, 1, k_len))?;
    let same = q.broadcast_eq(&k)?;
    let keep = Tensor::zeros((batch, 1, q_len, k_len), super::MASK_DTYPE, q_segments.device())?;
    let drop = Tensor::full(f32::NEG_INFINITY, (batch, 1, q_len, k_len), q_segments.device())?;
    same.where_cond(&keep, &drop)
}
