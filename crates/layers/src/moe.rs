//! Routed mixture-of-experts feed-forward block.
//!
//! Every token is scored against `num_experts` gated MLP experts by a linear
//! router. The `num_experts_per_tok` best experts process the token and their
//! outputs are combined with the (optionally renormalised and scaled) routing
//! weights. Routing statistics stay in `f32`; the combined output is cast back
//! to the storage dtype. Experts run one at a time on the slice of tokens
//! routed to them, so no capacity factor or token dropping is involved.

use candle_core::{DType, Device, Error, Result, Tensor, D};
use candle_nn::ops::{sigmoid, softmax_last_dim};

use crate::{
    activations::ActivationKind,
    checks,
    dtypes::PrecisionPolicy,
    linear::{DenseInit, Linear, LinearConfig},
    mlp::{FeedForwardConfig, MlpBlock},
};

/// Function turning router logits into expert scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingScore {
    Softmax,
    Sigmoid,
}

impl std::str::FromStr for RoutingScore {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "softmax" => Ok(RoutingScore::Softmax),
            "sigmoid" => Ok(RoutingScore::Sigmoid),
            other => Err(Error::Msg(format!("unknown routing score function '{other}'"))),
        }
    }
}

/// Configuration of a routed expert block.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeConfig {
    pub hidden_size: usize,
    /// Intermediate width of every expert.
    pub mlp_dim: usize,
    pub num_experts: usize,
    pub num_experts_per_tok: usize,
    pub activations: Vec<ActivationKind>,
    pub score: RoutingScore,
    /// Renormalise the selected weights so they sum to one per token.
    pub norm_topk_prob: bool,
    /// Multiplier applied to the selected weights after renormalisation.
    pub routed_scaling_factor: f32,
    /// Weight of the load balancing loss; zero disables it.
    pub load_balance_loss_weight: f32,
}

impl MoeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_experts == 0 {
            return Err(Error::Msg("num_experts must be greater than zero".into()));
        }
        if self.num_experts_per_tok == 0 || self.num_experts_per_tok > self.num_experts {
            return Err(Error::Msg(format!(
                "num_experts_per_tok ({}) must be within 1..={}",
                self.num_experts_per_tok, self.num_experts
            )));
        }
        if self.load_balance_loss_weight < 0.0 {
            return Err(Error::Msg("load_balance_loss_weight must be >= 0".into()));
        }
        Ok(())
    }
}

/// Result of a routed forward pass.
#[derive(Debug, Clone)]
pub struct MoeOutput {
    /// Combined expert output shaped like the input.
    pub hidden: Tensor,
    /// Scalar auxiliary loss, present only for non-deterministic calls with a positive weight.
    pub load_balance_loss: Option<Tensor>,
}

/// Per-token routing decision.
#[derive(Debug, Clone)]
pub struct Routing {
    /// `(tokens, num_experts)` scores in f32.
    pub scores: Tensor,
    /// Selected expert ids per token, best first.
    pub experts: Vec<Vec<u32>>,
    /// Combine weights matching `experts`.
    pub weights: Vec<Vec<f32>>,
}

/// Router plus experts.
#[derive(Debug, Clone)]
pub struct MoeBlock {
    config: MoeConfig,
    gate: Linear,
    experts: Vec<MlpBlock>,
}

impl MoeBlock {
    /// Initialises the router with `gate_init` and each expert with consecutive seeds from `expert_init`.
    pub fn new(
        config: MoeConfig,
        gate_init: &DenseInit,
        expert_init: &DenseInit,
        device: &Device,
        weight_dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let gate = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.num_experts),
            gate_init,
            device,
            weight_dtype,
        )?;
        let experts = (0..config.num_experts)
            .map(|idx| {
                let seed = expert_init.seed.wrapping_add(idx as u64 * 3);
                MlpBlock::new(
                    expert_feed_forward_config(&config),
                    &expert_init.with_seed(seed),
                    device,
                    weight_dtype,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "moe init: experts={} top_k={} score={:?} mlp_dim={}",
            config.num_experts,
            config.num_experts_per_tok,
            config.score,
            config.mlp_dim
        );
        Ok(Self {
            config,
            gate,
            experts,
        })
    }

    /// Builds the block from an explicit router kernel and experts.
    pub fn from_parts(config: MoeConfig, gate: Tensor, experts: Vec<MlpBlock>) -> Result<Self> {
        config.validate()?;
        if experts.len() != config.num_experts {
            return Err(Error::Msg(format!(
                "expected {} experts, got {}",
                config.num_experts,
                experts.len()
            )));
        }
        let gate = Linear::new(
            LinearConfig::new(config.hidden_size, config.num_experts),
            gate,
            None,
        )?;
        Ok(Self {
            config,
            gate,
            experts,
        })
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    /// Scores `tokens` (`(n, hidden)`) and picks the top experts for each row.
    pub fn route(&self, tokens: &Tensor, policy: &PrecisionPolicy) -> Result<Routing> {
        let logits = self.gate.forward(tokens, policy)?.to_dtype(DType::F32)?;
        let scores = match self.config.score {
            RoutingScore::Softmax => softmax_last_dim(&logits)?,
            RoutingScore::Sigmoid => sigmoid(&logits)?,
        };
        let (sorted, indices) = scores.contiguous()?.sort_last_dim(false)?;
        let k = self.config.num_experts_per_tok;
        let experts = indices.narrow(D::Minus1, 0, k)?.to_vec2::<u32>()?;
        let mut weights = sorted.narrow(D::Minus1, 0, k)?.to_vec2::<f32>()?;
        for row in weights.iter_mut() {
            if self.config.norm_topk_prob {
                let denom: f32 = row.iter().sum::<f32>() + 1e-20;
                row.iter_mut().for_each(|w| *w /= denom);
            }
            row.iter_mut()
                .for_each(|w| *w *= self.config.routed_scaling_factor);
        }
        Ok(Routing {
            scores,
            experts,
            weights,
        })
    }

    /// Routes every token of `hidden` (`(batch, seq, hidden)`) through its selected experts.
    pub fn forward(&self, hidden: &Tensor, deterministic: bool, policy: &PrecisionPolicy) -> Result<MoeOutput> {
        checks::expect_batch_seq_hidden("moe.input", hidden, self.config.hidden_size)?;
        let (batch, seq, width) = hidden.dims3()?;
        let tokens = hidden.reshape((batch * seq, width))?;
        let routing = self.route(&tokens, policy)?;

        let mut assignments: Vec<Vec<(u32, f32)>> = vec![Vec::new(); self.config.num_experts];
        for (token, (ids, weights)) in routing.experts.iter().zip(&routing.weights).enumerate() {
            for (&expert, &weight) in ids.iter().zip(weights) {
                let slot = assignments.get_mut(expert as usize).ok_or_else(|| {
                    Error::Msg(format!("router selected unknown expert {expert}"))
                })?;
                slot.push((token as u32, weight));
            }
        }

        let device = hidden.device();
        let mut combined = Tensor::zeros((batch * seq, width), DType::F32, device)?;
        for (expert, routed) in self.experts.iter().zip(&assignments) {
            if routed.is_empty() {
                continue;
            }
            let rows: Vec<u32> = routed.iter().map(|(row, _)| *row).collect();
            let scale: Vec<f32> = routed.iter().map(|(_, weight)| *weight).collect();
            let count = rows.len();
            let rows = Tensor::from_vec(rows, count, device)?;
            let scale = Tensor::from_vec(scale, (count, 1), device)?;
            let expert_in = tokens.index_select(&rows, 0)?;
            let expert_out = expert
                .forward(&expert_in, deterministic, policy)?
                .to_dtype(DType::F32)?
                .broadcast_mul(&scale)?;
            combined = combined.index_add(&rows, &expert_out, 0)?;
        }

        let load_balance_loss = if !deterministic && self.config.load_balance_loss_weight > 0.0 {
            Some(self.load_balance_loss(&routing, &assignments)?)
        } else {
            None
        };

        let hidden = policy.cast_to_storage(&combined.reshape((batch, seq, width))?)?;
        Ok(MoeOutput {
            hidden,
            load_balance_loss,
        })
    }

    // weight * E * sum_e(fraction of assignments to e * mean score of e)
    fn load_balance_loss(&self, routing: &Routing, assignments: &[Vec<(u32, f32)>]) -> Result<Tensor> {
        let total: usize = assignments.iter().map(Vec::len).sum();
        let fractions: Vec<f32> = assignments
            .iter()
            .map(|routed| routed.len() as f32 / total.max(1) as f32)
            .collect();
        let num_experts = self.config.num_experts;
        let fractions = Tensor::from_vec(fractions, num_experts, routing.scores.device())?;
        let mean_scores = routing.scores.mean(0)?;
        let scale = f64::from(self.config.load_balance_loss_weight) * num_experts as f64;
        fractions.mul(&mean_scores)?.sum_all()?.affine(scale, 0.0)
    }
}

fn expert_feed_forward_config(config: &MoeConfig) -> FeedForwardConfig {
    FeedForwardConfig::new(config.hidden_size, config.mlp_dim, config.activations.clone())
}
