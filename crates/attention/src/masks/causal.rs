//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask shaped `[batch, 1, q_len, k_len]`.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, so a decode step sees the whole cached prefix.
pub fn build_causal_mask(device: &Device, batch: usize, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut row_major = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        let row = &mut row_major[q * k_len..(q + 1) * k_len];
        for slot in row.iter_mut().skip(q + offset + 1) {
            *slot = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(row_major, (1, 1, q_len, k_len), device)?.repeat((batch, 1, 1, 1))
}
