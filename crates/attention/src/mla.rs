//! Multi-head latent attention.
//!
//! Keys and values are reconstructed from a low-rank latent produced by
//! `wkv_a`, normalised by `kv_norm` and expanded by `wkv_b`. A single rotary
//! key head (`qk_rope_head_dim` wide) is shared by every query head. Queries
//! either come from one dense projection (`q_lora_rank == 0`) or from a
//! low-rank pair with its own norm.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use embedding::{Rope, RopeConfig, RopeLayout};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{DenseInit, Linear, LinearConfig},
    norm::{NormConfig, RmsNorm},
};

use crate::core::{Attention, AttentionError, Config};
use crate::kv_cache::{KeyValueCache, LayerKvCache};
use crate::masks::{build_causal_mask, build_segment_mask, combine_masks};
use crate::mode::ModelMode;
use crate::reference::ExactAttention;

/// Geometry and runtime limits of a latent attention layer.
#[derive(Debug, Clone, PartialEq)]
pub struct MlaConfig {
    pub hidden_size: usize,
    pub num_heads: usize,
    /// Rank of the query bottleneck; `0` selects a single dense projection.
    pub q_lora_rank: usize,
    pub kv_lora_rank: usize,
    pub qk_nope_head_dim: usize,
    pub qk_rope_head_dim: usize,
    pub v_head_dim: usize,
    pub rope_theta: f32,
    pub max_target_length: usize,
    pub max_prefill_predict_length: usize,
    pub dropout_rate: f32,
    pub norm_epsilon: f64,
}

impl MlaConfig {
    pub fn qk_head_dim(&self) -> usize {
        self.qk_nope_head_dim + self.qk_rope_head_dim
    }

    /// Softmax scale `qk_head_dim^-0.5`.
    pub fn softmax_scale(&self) -> f32 {
        (self.qk_head_dim() as f32).powf(-0.5)
    }

    pub fn validate(&self) -> Result<(), AttentionError> {
        let mut problems = Vec::new();
        if self.hidden_size == 0 || self.num_heads == 0 {
            problems.push("hidden_size and num_heads must be non-zero".to_string());
        }
        if self.kv_lora_rank == 0 {
            problems.push("kv_lora_rank must be non-zero".to_string());
        }
        if self.qk_rope_head_dim == 0 || self.qk_rope_head_dim % 2 != 0 {
            problems.push(format!(
                "qk_rope_head_dim must be even and non-zero, got {}",
                self.qk_rope_head_dim
            ));
        }
        if self.v_head_dim == 0 {
            problems.push("v_head_dim must be non-zero".to_string());
        }
        if self.max_prefill_predict_length > self.max_target_length {
            problems.push(format!(
                "max_prefill_predict_length ({}) exceeds max_target_length ({})",
                self.max_prefill_predict_length, self.max_target_length
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            problems.push(format!("dropout_rate must be in [0, 1), got {}", self.dropout_rate));
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::shape(problems.join("; ")))
        }
    }
}

#[derive(Debug, Clone)]
enum QueryProjection {
    Dense(Linear),
    LowRank {
        wq_a: Linear,
        q_norm: RmsNorm,
        wq_b: Linear,
    },
}

// Keeps the attention dropout stream apart from the projection seeds.
const ATTENTION_DROPOUT_SEED_OFFSET: u64 = 5;

/// Multi-head latent attention with an optional per-layer cache.
#[derive(Debug)]
pub struct MultiHeadLatentAttention {
    config: MlaConfig,
    query: QueryProjection,
    wkv_a: Linear,
    kv_norm: RmsNorm,
    wkv_b: Linear,
    out: Linear,
    rope: Rope,
    kernel: ExactAttention,
    first_call: OnceLock<()>,
}

impl MultiHeadLatentAttention {
    /// Builds every projection from `init`, deriving one seed per kernel.
    pub fn new(
        config: MlaConfig,
        init: &DenseInit,
        device: &Device,
        weight_dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let heads = config.num_heads;
        let qk_head_dim = config.qk_head_dim();
        let seed = init.seed;

        let query = if config.q_lora_rank == 0 {
            QueryProjection::Dense(Linear::with_init(
                LinearConfig::new(config.hidden_size, heads * qk_head_dim),
                &init.with_seed(seed),
                device,
                weight_dtype,
            )?)
        } else {
            QueryProjection::LowRank {
                wq_a: Linear::with_init(
                    LinearConfig::new(config.hidden_size, config.q_lora_rank),
                    &init.with_seed(seed),
                    device,
                    weight_dtype,
                )?,
                q_norm: RmsNorm::ones(
                    NormConfig::new(config.q_lora_rank, config.norm_epsilon),
                    device,
                    weight_dtype,
                )?,
                wq_b: Linear::with_init(
                    LinearConfig::new(config.q_lora_rank, heads * qk_head_dim),
                    &init.with_seed(seed.wrapping_add(1)),
                    device,
                    weight_dtype,
                )?,
            }
        };

        let wkv_a = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.kv_lora_rank + config.qk_rope_head_dim),
            &init.with_seed(seed.wrapping_add(2)),
            device,
            weight_dtype,
        )?;
        let kv_norm = RmsNorm::ones(
            NormConfig::new(config.kv_lora_rank, config.norm_epsilon),
            device,
            weight_dtype,
        )?;
        let wkv_b = Linear::with_init(
            LinearConfig::new(
                config.kv_lora_rank,
                heads * (config.qk_nope_head_dim + config.v_head_dim),
            ),
            &init.with_seed(seed.wrapping_add(3)),
            device,
            weight_dtype,
        )?;
        let out = Linear::with_init(
            LinearConfig::new(heads * config.v_head_dim, config.hidden_size),
            &init.with_seed(seed.wrapping_add(4)),
            device,
            weight_dtype,
        )?;
        let rope = Rope::new(RopeConfig {
            layout: RopeLayout::Interleaved,
            ..RopeConfig::new(config.qk_rope_head_dim, config.rope_theta)
        })?;

        Ok(Self {
            config,
            query,
            wkv_a,
            kv_norm,
            wkv_b,
            out,
            rope,
            kernel: ExactAttention::with_seed(seed.wrapping_add(ATTENTION_DROPOUT_SEED_OFFSET)),
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &MlaConfig {
        &self.config
    }

    /// Projects `inputs` to queries `[b, heads, s, qk_head_dim]` with rotated tails.
    fn queries(
        &self,
        inputs: &Tensor,
        positions: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, AttentionError> {
        let (batch, seq, _) = inputs.dims3()?;
        let projected = match &self.query {
            QueryProjection::Dense(wq) => wq.forward(inputs, policy)?,
            QueryProjection::LowRank { wq_a, q_norm, wq_b } => {
                let low = wq_a.forward(inputs, policy)?;
                let low = q_norm.forward(&low, policy)?;
                wq_b.forward(&low, policy)?
            }
        };
        let nope = self.config.qk_nope_head_dim;
        let rope_dim = self.config.qk_rope_head_dim;
        let q = projected
            .reshape((batch, seq, self.config.num_heads, nope + rope_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let q_pe = self
            .rope
            .apply(&q.narrow(3, nope, rope_dim)?.contiguous()?, positions)?;
        if nope == 0 {
            return Ok(q_pe);
        }
        Ok(Tensor::cat(&[&q.narrow(3, 0, nope)?, &q_pe], 3)?)
    }

    /// Projects `inputs` to keys `[b, heads, s, qk_head_dim]` and values `[b, heads, s, v_head_dim]`.
    fn keys_values(
        &self,
        inputs: &Tensor,
        positions: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let (batch, seq, _) = inputs.dims3()?;
        let heads = self.config.num_heads;
        let nope = self.config.qk_nope_head_dim;
        let rope_dim = self.config.qk_rope_head_dim;
        let v_dim = self.config.v_head_dim;
        let lora = self.config.kv_lora_rank;

        let kv = self.wkv_a.forward(inputs, policy)?;
        let latent = self.kv_norm.forward(&kv.narrow(2, 0, lora)?, policy)?;
        let key_rope = kv
            .narrow(2, lora, rope_dim)?
            .reshape((batch, 1, seq, rope_dim))?;
        let key_rope = self
            .rope
            .apply(&key_rope, positions)?
            .broadcast_as((batch, heads, seq, rope_dim))?;

        let expanded = self
            .wkv_b
            .forward(&latent, policy)?
            .reshape((batch, seq, heads, nope + v_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let value = expanded.narrow(3, nope, v_dim)?.contiguous()?;
        let key = if nope == 0 {
            key_rope.contiguous()?
        } else {
            Tensor::cat(&[&expanded.narrow(3, 0, nope)?, &key_rope.contiguous()?], 3)?
        };
        Ok((key, value))
    }

    /// Runs attention for `inputs_q` against `inputs_kv`.
    ///
    /// * `positions`: `[batch, seq]` absolute positions of the new tokens.
    /// * `segment_ids`: optional `[batch, seq]` ids; `None` treats every token as one segment.
    /// * `cache`: required for [`ModelMode::Prefill`] and [`ModelMode::Autoregressive`].
    ///
    /// The result is `[batch, seq, hidden_size]` in the storage dtype of `policy`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        inputs_q: &Tensor,
        inputs_kv: &Tensor,
        positions: &Tensor,
        segment_ids: Option<&Tensor>,
        deterministic: bool,
        mode: ModelMode,
        cache: Option<&mut LayerKvCache>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor, AttentionError> {
        checks::expect_batch_seq_hidden("mla.inputs_q", inputs_q, self.config.hidden_size)?;
        checks::expect_batch_seq_hidden("mla.inputs_kv", inputs_kv, self.config.hidden_size)?;
        let (batch, seq, _) = inputs_q.dims3()?;
        let device = inputs_q.device();

        if self.first_call.set(()).is_ok() {
            log::info!(
                "mla init heads={} q_lora_rank={} kv_lora_rank={} qk_nope={} qk_rope={} v_head_dim={} max_target={} dtype={:?}",
                self.config.num_heads,
                self.config.q_lora_rank,
                self.config.kv_lora_rank,
                self.config.qk_nope_head_dim,
                self.config.qk_rope_head_dim,
                self.config.v_head_dim,
                self.config.max_target_length,
                policy.storage()
            );
        }

        let segments = match segment_ids {
            Some(ids) => {
                if ids.dims() != [batch, seq].as_slice() {
                    return Err(AttentionError::shape(format!(
                        "segment ids {:?}, expected [{batch}, {seq}]",
                        ids.dims()
                    )));
                }
                ids.to_dtype(DType::I64)?
            }
            None => Tensor::ones((batch, seq), DType::I64, device)?,
        };

        let query = self.queries(inputs_q, positions, policy)?;
        let (key, value) = self.keys_values(inputs_kv, positions, policy)?;

        let (key, value, key_segments) = match (mode, cache) {
            (ModelMode::Train, _) => (key, value, segments.clone()),
            (ModelMode::Prefill, Some(cache)) => {
                if seq > self.config.max_prefill_predict_length {
                    return Err(AttentionError::cache(format!(
                        "prefill length {seq} exceeds max_prefill_predict_length {}",
                        self.config.max_prefill_predict_length
                    )));
                }
                cache.reset();
                cache.append(
                    &policy.cast_to_storage(&key)?,
                    &policy.cast_to_storage(&value)?,
                    &segments,
                )?;
                (key, value, segments.clone())
            }
            (ModelMode::Autoregressive, Some(cache)) => {
                if cache.len() + seq > self.config.max_target_length {
                    return Err(AttentionError::cache(format!(
                        "decode step would grow the cache to {} past max_target_length {}",
                        cache.len() + seq,
                        self.config.max_target_length
                    )));
                }
                cache.append(
                    &policy.cast_to_storage(&key)?,
                    &policy.cast_to_storage(&value)?,
                    &segments,
                )?;
                let (keys, values, cached_segments) = cache
                    .view()
                    .ok_or_else(|| AttentionError::cache("cache empty after append"))?;
                (
                    policy.cast_for_matmul(&keys)?,
                    policy.cast_for_matmul(&values)?,
                    cached_segments,
                )
            }
            (mode, None) => {
                return Err(AttentionError::cache(format!("{mode} mode requires a kv cache")));
            }
        };

        let k_len = key.dim(2)?;
        let causal = build_causal_mask(device, batch, seq, k_len)?;
        let segment_mask = build_segment_mask(&segments, &key_segments)?;
        let mask = combine_masks(&causal, Some(&segment_mask))?;

        let attn_config = Config::with_scale(self.config.softmax_scale())
            .with_dropout(self.config.dropout_rate, deterministic);
        let attended = self
            .kernel
            .attend(&query, &key, &value, Some(&mask), &attn_config)?;

        let merged = attended
            .transpose(1, 2)?
            .reshape((batch, seq, self.config.num_heads * self.config.v_head_dim))?;
        let projected = self.out.forward(&merged, policy)?;
        Ok(policy.cast_to_storage(&projected)?)
    }
}
