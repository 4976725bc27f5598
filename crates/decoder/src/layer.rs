//! DeepSeek decoder layer.
//!
//! Pre-norm layout: RMSNorm → latent attention → residual, then RMSNorm →
//! feed-forward → residual. The feed-forward half is either one wide gated MLP
//! (dense layers) or a shared-expert MLP plus a routed expert block (MoE
//! layers). Every intermediate activation is checked against the
//! `(activation_batch, activation_norm_length, activation_embed)` sharding
//! annotation.

use std::fmt;

use attention::{LayerKvCache, ModelMode, MultiHeadLatentAttention};
use candle_core::{Device, Tensor};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    residual::residual_add,
    DenseInit, MlpBlock, MoeBlock, MoeOutput, NormConfig, RmsNorm,
};

use crate::config::{DecoderConfig, RematPolicy};
use crate::error::Result;
use crate::metrics::{ActivationStats, Intermediates};
use crate::sharding::{ShardingContext, ACTIVATION_AXES};

/// Checkpoint name of the layer input.
pub const DECODER_LAYER_INPUT: &str = "decoder_layer_input";

/// Which feed-forward half a layer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedForwardKind {
    Dense,
    MixtureOfExperts,
}

#[derive(Debug)]
enum FeedForward {
    Dense { mlp: MlpBlock },
    MixtureOfExperts { mlp: MlpBlock, moe: MoeBlock },
}

/// Output of [`DecoderLayer::forward`].
#[derive(Debug, Clone)]
pub struct LayerOutput {
    /// `(batch, seq, emb_dim)` in the configured activation dtype.
    pub hidden: Tensor,
    pub intermediates: Intermediates,
}

pub struct DecoderLayer {
    index: usize,
    kind: FeedForwardKind,
    emb_dim: usize,
    policy: PrecisionPolicy,
    remat_policy: RematPolicy,
    record_internal_nn_metrics: bool,
    sharding: ShardingContext,
    pre_self_attention_layer_norm: RmsNorm,
    self_attention: MultiHeadLatentAttention,
    post_self_attention_layer_norm: RmsNorm,
    feed_forward: FeedForward,
}

impl fmt::Debug for DecoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderLayer")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("emb_dim", &self.emb_dim)
            .field("storage", &self.policy.storage())
            .finish()
    }
}

// Seeds are spaced so layers and sub-modules never share a kernel stream.
const LAYER_SEED_STRIDE: u64 = 10_000;
const MLP_SEED_OFFSET: u64 = 100;
const GATE_SEED_OFFSET: u64 = 200;
const EXPERT_SEED_OFFSET: u64 = 1_000;

impl DecoderLayer {
    pub fn new(
        config: &DecoderConfig,
        kind: FeedForwardKind,
        index: usize,
        sharding: ShardingContext,
        device: &Device,
    ) -> Result<Self> {
        let storage = config.activation_dtype()?;
        let weight_dtype = config.parameter_dtype()?;
        let policy = PrecisionPolicy::for_activations(storage);
        let seed = config
            .init_seed
            .wrapping_add(index as u64 * LAYER_SEED_STRIDE);
        let init = DenseInit::truncated_normal(1.0, seed);
        let norm_config = NormConfig::new(config.emb_dim, config.normalization_layer_epsilon);

        let pre_self_attention_layer_norm = RmsNorm::ones(norm_config.clone(), device, weight_dtype)?;
        let self_attention =
            MultiHeadLatentAttention::new(config.mla_config(), &init, device, weight_dtype)?;
        let post_self_attention_layer_norm = RmsNorm::ones(norm_config, device, weight_dtype)?;

        let mlp_init = init.with_seed(seed.wrapping_add(MLP_SEED_OFFSET));
        let feed_forward = match kind {
            FeedForwardKind::Dense => FeedForward::Dense {
                mlp: MlpBlock::new(config.dense_mlp_config()?, &mlp_init, device, weight_dtype)?,
            },
            FeedForwardKind::MixtureOfExperts => FeedForward::MixtureOfExperts {
                mlp: MlpBlock::new(config.shared_mlp_config()?, &mlp_init, device, weight_dtype)?,
                moe: MoeBlock::new(
                    config.moe_config()?,
                    &init.with_seed(seed.wrapping_add(GATE_SEED_OFFSET)),
                    &init.with_seed(seed.wrapping_add(EXPERT_SEED_OFFSET)),
                    device,
                    weight_dtype,
                )?,
            },
        };

        log::debug!(
            "decoder layer {} init kind={:?} emb_dim={} storage={:?} weights={:?}",
            index,
            kind,
            config.emb_dim,
            storage,
            weight_dtype
        );

        Ok(Self {
            index,
            kind,
            emb_dim: config.emb_dim,
            policy,
            remat_policy: config.remat_policy,
            record_internal_nn_metrics: config.record_internal_nn_metrics,
            sharding,
            pre_self_attention_layer_norm,
            self_attention,
            post_self_attention_layer_norm,
            feed_forward,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> FeedForwardKind {
        self.kind
    }

    /// Names of the sub-modules owning parameters, in execution order.
    pub fn parameter_names(&self) -> Vec<&'static str> {
        let mut names = vec![
            "pre_self_attention_layer_norm",
            "self_attention",
            "post_self_attention_layer_norm",
            "mlp",
        ];
        if self.kind == FeedForwardKind::MixtureOfExperts {
            names.push("MoeBlock_0");
        }
        names
    }

    fn constrain(&self, tensor: &Tensor) -> Result<Tensor> {
        self.sharding.constrain(tensor, &ACTIVATION_AXES)
    }

    /// Runs the layer on `inputs` shaped `(batch, seq, emb_dim)`.
    ///
    /// `positions` and `segment_ids` are `(batch, seq)`; `cache` is required
    /// for prefill and autoregressive modes.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        inputs: &Tensor,
        segment_ids: Option<&Tensor>,
        positions: &Tensor,
        deterministic: bool,
        mode: ModelMode,
        cache: Option<&mut LayerKvCache>,
    ) -> Result<LayerOutput> {
        checks::expect_batch_seq_hidden("decoder_layer.inputs", inputs, self.emb_dim)?;
        let policy = &self.policy;
        let mut intermediates = Intermediates::new();

        let inputs = self.constrain(&policy.cast_to_storage(inputs)?)?;
        if self.remat_policy == RematPolicy::SaveDecoderLayerInput {
            intermediates.save_checkpoint(DECODER_LAYER_INPUT, inputs.clone());
        }

        let lnx = self.pre_self_attention_layer_norm.forward(&inputs, policy)?;
        let lnx = self.constrain(&lnx)?;

        let attention_lnx = self.self_attention.forward(
            &lnx,
            &lnx,
            positions,
            segment_ids,
            deterministic,
            mode,
            cache,
            policy,
        )?;
        let attention_lnx = self.constrain(&attention_lnx)?;
        let intermediate_inputs = residual_add(&attention_lnx, &inputs, policy)?;

        let hidden_states = self
            .post_self_attention_layer_norm
            .forward(&intermediate_inputs, policy)?;
        let hidden_states = self.constrain(&hidden_states)?;

        let mlp_lnx = match &self.feed_forward {
            FeedForward::Dense { mlp } => {
                self.constrain(&mlp.forward(&hidden_states, deterministic, policy)?)?
            }
            FeedForward::MixtureOfExperts { mlp, moe } => {
                let shared = self.constrain(&mlp.forward(&hidden_states, deterministic, policy)?)?;
                // The auxiliary loss is not propagated out of the layer.
                let MoeOutput { hidden: routed, .. } =
                    moe.forward(&hidden_states, deterministic, policy)?;
                let routed = self.constrain(&routed)?;
                self.constrain(&residual_add(&routed, &shared, policy)?)?
            }
        };

        let layer_output = residual_add(&mlp_lnx, &intermediate_inputs, policy)?;
        let layer_output = self.constrain(&layer_output)?;

        if self.record_internal_nn_metrics {
            let stats = ActivationStats::compute(&layer_output)?;
            log::debug!(
                "layer {} activations mean={:.6} stdev={:.6} zero={:.4}",
                self.index,
                stats.mean,
                stats.stdev,
                stats.fraction_zero
            );
            intermediates.record_activation_stats(&stats);
        }

        Ok(LayerOutput {
            hidden: layer_output,
            intermediates,
        })
    }

    /// Scan form of [`forward`](Self::forward): returns `(carry, None)` and
    /// appends the layer's intermediates to `sink`.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_step(
        &self,
        carry: &Tensor,
        segment_ids: Option<&Tensor>,
        positions: &Tensor,
        deterministic: bool,
        mode: ModelMode,
        cache: Option<&mut LayerKvCache>,
        sink: &mut Intermediates,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let LayerOutput {
            hidden,
            intermediates,
        } = self.forward(carry, segment_ids, positions, deterministic, mode, cache)?;
        sink.absorb_flat(intermediates);
        Ok((hidden, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn small_config() -> DecoderConfig {
        DecoderConfig {
            emb_dim: 16,
            num_query_heads: 2,
            kv_lora_rank: 8,
            qk_nope_head_dim: 4,
            qk_rope_head_dim: 4,
            head_dim: 4,
            mlp_dim: 8,
            num_experts: 4,
            num_experts_per_tok: 2,
            max_target_length: 16,
            max_prefill_predict_length: 8,
            ..DecoderConfig::default()
        }
    }

    fn positions(batch: usize, seq: usize) -> candle_core::Result<Tensor> {
        Tensor::arange(0u32, seq as u32, &Device::Cpu)?
            .unsqueeze(0)?
            .repeat((batch, 1))
    }

    #[test]
    fn both_layer_kinds_preserve_shape_and_dtype() -> Result<()> {
        let config = small_config();
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu)?;
        for kind in [FeedForwardKind::Dense, FeedForwardKind::MixtureOfExperts] {
            let layer = DecoderLayer::new(&config, kind, 0, ShardingContext::default(), &Device::Cpu)?;
            let out = layer.forward(&x, None, &positions(2, 5)?, true, ModelMode::Train, None)?;
            assert_eq!(out.hidden.dims(), &[2, 5, 16]);
            assert_eq!(out.hidden.dtype(), DType::F32);
            assert!(out.intermediates.is_empty());
        }
        Ok(())
    }

    #[test]
    fn parameter_names_follow_layer_kind() -> Result<()> {
        let config = small_config();
        let dense = DecoderLayer::new(&config, FeedForwardKind::Dense, 0, ShardingContext::default(), &Device::Cpu)?;
        let moe = DecoderLayer::new(
            &config,
            FeedForwardKind::MixtureOfExperts,
            1,
            ShardingContext::default(),
            &Device::Cpu,
        )?;
        assert!(!dense.parameter_names().contains(&"MoeBlock_0"));
        assert_eq!(moe.parameter_names().last(), Some(&"MoeBlock_0"));
        Ok(())
    }

    #[test]
    fn records_metrics_and_checkpoint_when_enabled() -> Result<()> {
        let config = DecoderConfig {
            record_internal_nn_metrics: true,
            remat_policy: RematPolicy::SaveDecoderLayerInput,
            ..small_config()
        };
        let layer = DecoderLayer::new(&config, FeedForwardKind::Dense, 0, ShardingContext::default(), &Device::Cpu)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &Device::Cpu)?;
        let out = layer.forward(&x, None, &positions(1, 3)?, true, ModelMode::Train, None)?;

        let stats = ActivationStats::compute(&out.hidden)?;
        assert_eq!(out.intermediates.scalar("activation_mean"), Some(&[stats.mean][..]));
        assert_eq!(out.intermediates.scalar("activation_stdev"), Some(&[stats.stdev][..]));
        assert_eq!(
            out.intermediates.scalar("activation_fraction_zero"),
            Some(&[stats.fraction_zero][..])
        );
        let saved = out
            .intermediates
            .checkpoint(DECODER_LAYER_INPUT)
            .map(|t| t.len());
        assert_eq!(saved, Some(1));
        Ok(())
    }

    #[test]
    fn scan_step_returns_carry_and_none() -> Result<()> {
        let config = small_config();
        let layer = DecoderLayer::new(&config, FeedForwardKind::Dense, 0, ShardingContext::default(), &Device::Cpu)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &Device::Cpu)?;
        let direct = layer.forward(&x, None, &positions(1, 3)?, true, ModelMode::Train, None)?;
        let mut sink = Intermediates::new();
        let (carry, output) =
            layer.scan_step(&x, None, &positions(1, 3)?, true, ModelMode::Train, None, &mut sink)?;
        assert!(output.is_none());
        let diff = carry.sub(&direct.hidden)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    // Re-runs every sub-module by hand in the documented order.
    fn composed_by_hand(layer: &DecoderLayer, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let policy = &layer.policy;
        let lnx = layer.pre_self_attention_layer_norm.forward(x, policy)?;
        let attention = layer.self_attention.forward(
            &lnx,
            &lnx,
            positions,
            None,
            true,
            ModelMode::Train,
            None,
            policy,
        )?;
        let intermediate = x.add(&attention)?;
        let hidden = layer
            .post_self_attention_layer_norm
            .forward(&intermediate, policy)?;
        let mlp_out = match &layer.feed_forward {
            FeedForward::Dense { mlp } => mlp.forward(&hidden, true, policy)?,
            FeedForward::MixtureOfExperts { mlp, moe } => {
                let shared = mlp.forward(&hidden, true, policy)?;
                shared.add(&moe.forward(&hidden, true, policy)?.hidden)?
            }
        };
        Ok(mlp_out.add(&intermediate)?)
    }

    #[test]
    fn forward_matches_hand_composed_sub_modules() -> Result<()> {
        let config = small_config();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 16), &Device::Cpu)?;
        let positions = positions(2, 4)?;
        for kind in [FeedForwardKind::Dense, FeedForwardKind::MixtureOfExperts] {
            let layer = DecoderLayer::new(&config, kind, 3, ShardingContext::default(), &Device::Cpu)?;
            let out = layer.forward(&x, None, &positions, true, ModelMode::Train, None)?;
            let expected = composed_by_hand(&layer, &x, &positions)?;
            let diff = out
                .hidden
                .sub(&expected)?
                .abs()?
                .max_all()?
                .to_scalar::<f32>()?;
            assert!(diff < 1e-5, "{kind:?} diverged by {diff}");

            // Feeding the pre-norm output into the residual must not agree.
            let lnx = layer.pre_self_attention_layer_norm.forward(&x, &layer.policy)?;
            let skewed = composed_by_hand(&layer, &lnx, &positions)?;
            let gap = out.hidden.sub(&skewed)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(gap > 1e-3, "{kind:?} insensitive to the residual source");
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_embedding_width() -> Result<()> {
        let layer = DecoderLayer::new(
            &small_config(),
            FeedForwardKind::Dense,
            0,
            ShardingContext::default(),
            &Device::Cpu,
        )?;
        let x = Tensor::zeros((1, 3, 8), DType::F32, &Device::Cpu)?;
        assert!(layer
            .forward(&x, None, &positions(1, 3)?, true, ModelMode::Train, None)
            .is_err());
        Ok(())
    }
}
