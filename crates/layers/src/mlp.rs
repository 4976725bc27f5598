//! Gated position-wise feed-forward blocks.
//!
//! An MLP consumes `(batch, seq, hidden)` (or `(tokens, hidden)` when called
//! on routed expert slices) and returns the same layout. A single fused input
//! projection produces one `intermediate_size` chunk per configured
//! activation; each chunk is activated and the chunks are multiplied together
//! (`["silu", "linear"]` is SwiGLU). Intermediate dropout runs between the
//! gate product and the output projection.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{
    activations::ActivationKind,
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{DenseInit, Linear, LinearConfig},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of each activation chunk.
    pub intermediate_size: usize,
    /// Activation applied to each fused projection chunk, in order.
    pub activations: Vec<ActivationKind>,
    /// Dropout applied to the gated intermediate during training.
    pub dropout_rate: f32,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activations: Vec<ActivationKind>) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activations,
            dropout_rate: 0.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.intermediate_size == 0 {
            return Err(Error::Msg(format!(
                "mlp dimensions must be non-zero (hidden={}, intermediate={})",
                self.hidden_size, self.intermediate_size
            )));
        }
        if self.activations.is_empty() {
            return Err(Error::Msg("mlp requires at least one activation".into()));
        }
        Ok(())
    }
}

/// Gated MLP: `wo(dropout(prod_i act_i(wi_i(x))))`.
#[derive(Debug, Clone)]
pub struct MlpBlock {
    config: FeedForwardConfig,
    wi: Linear,
    wo: Linear,
    dropout: Dropout,
}

impl MlpBlock {
    /// Initialises both projections from `init`; the output kernel uses the next seed.
    pub fn new(
        config: FeedForwardConfig,
        init: &DenseInit,
        device: &Device,
        weight_dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let wi = Linear::with_init(
            LinearConfig::fused(
                config.hidden_size,
                config.intermediate_size,
                config.activations.len(),
            ),
            init,
            device,
            weight_dtype,
        )?;
        let wo = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            &init.with_seed(init.seed.wrapping_add(1)),
            device,
            weight_dtype,
        )?;
        let dropout = Dropout::new(config.dropout_rate, init.seed.wrapping_add(2))?;
        Ok(Self {
            config,
            wi,
            wo,
            dropout,
        })
    }

    /// Builds the block from explicit `(n * intermediate, hidden)` and `(hidden, intermediate)` kernels.
    pub fn from_weights(config: FeedForwardConfig, wi: Tensor, wo: Tensor) -> Result<Self> {
        config.validate()?;
        let wi = Linear::new(
            LinearConfig::fused(
                config.hidden_size,
                config.intermediate_size,
                config.activations.len(),
            ),
            wi,
            None,
        )?;
        let wo = Linear::new(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            wo,
            None,
        )?;
        let dropout = Dropout::new(config.dropout_rate, 0)?;
        Ok(Self {
            config,
            wi,
            wo,
            dropout,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Runs the block; the output is cast to the storage dtype of `policy`.
    pub fn forward(&self, hidden: &Tensor, deterministic: bool, policy: &PrecisionPolicy) -> Result<Tensor> {
        let fused = self.wi.forward(hidden, policy)?;
        let width = self.config.intermediate_size;
        let mut gated: Option<Tensor> = None;
        for (idx, activation) in self.config.activations.iter().enumerate() {
            let chunk = fused.narrow(D::Minus1, idx * width, width)?;
            let activated = activation.forward(&chunk, policy)?;
            gated = Some(match gated {
                Some(acc) => acc.mul(&activated)?,
                None => activated,
            });
        }
        let gated = gated.ok_or_else(|| Error::Msg("mlp requires at least one activation".into()))?;
        let gated = self.dropout.forward(&gated, deterministic)?;
        let output = self.wo.forward(&gated, policy)?;
        policy.cast_to_storage(&output)
    }
}
