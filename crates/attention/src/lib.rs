//! Attention primitives for DeepSeek-style decoder layers.
//!
//! Kernels implement the [`Attention`] trait over tensors laid out as
//! `[batch, n_heads, seq_len, head_dim]` and reduce in `f32`. Masks are
//! additive (`0.0` keep, `-inf` drop) and combine causal ordering with
//! segment ids for packed sequences.
//!
//! [`mla::MultiHeadLatentAttention`] is the layer-level entry point: it owns
//! the latent projections, applies rotary embeddings to the shared rope head
//! and drives a [`kv_cache::LayerKvCache`] during prefill and decode.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod mla;
pub mod mode;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use kv_cache::{KeyValueCache, LayerKvCache};
pub use mla::{MlaConfig, MultiHeadLatentAttention};
pub use mode::ModelMode;
