//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on tensors with layout `[batch, n_heads, seq_len, head_dim]`.
//! Queries and keys share `head_dim`; values may use a different width. The
//! output mirrors the query layout with the value width, and reductions
//! accumulate in `f32` regardless of the incoming dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` and `k` share the layout `[batch, n_heads, len, qk_dim]`.
/// * `v` is `[batch, n_heads, k_len, v_dim]`.
/// * The returned tensor is `[batch, n_heads, q_len, v_dim]` in the dtype of `q`.
/// * Masks, when present, are additive `f32` tensors shaped
///   `[batch, 1 or n_heads, q_len, k_len]`.
pub trait Attention {
    /// Compute attention with an optional additive mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
