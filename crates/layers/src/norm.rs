//! RMS normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention (or `(rows, hidden)` for
//! latent projections). Statistics are computed in
//! [`PrecisionPolicy::reduction`], the learned scale is applied in the compute
//! dtype, and the output is cast back to storage.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for an RMSNorm layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the normalised (last) dimension.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the mean square.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }
}

/// Root mean square norm with a learnable per-feature scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    scale: Tensor,
}

impl RmsNorm {
    /// Constructs an RMSNorm from an explicit scale vector.
    pub fn new(scale: Tensor, config: NormConfig) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm hidden size must be non-zero".into()));
        }
        checks::expect_shape("norm.scale", &scale, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.scale", &scale, &checks::FLOAT_DTYPES)?;
        Ok(Self { config, scale })
    }

    /// Constructs an RMSNorm whose scale starts at one.
    pub fn ones(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let scale = Tensor::ones(config.hidden_size, dtype, device)?;
        Self::new(scale, config)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }

    /// Normalises along the last axis and casts the result to storage.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let last = hidden.dim(D::Minus1)?;
        if last != self.config.hidden_size {
            return Err(Error::Msg(format!(
                "norm.input: expected last dim {}, got {:?}",
                self.config.hidden_size,
                hidden.dims()
            )));
        }

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (mean_square + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;
        let normalized = policy.cast_for_matmul(&normalized)?;
        let scale = policy.cast_for_matmul(&self.scale)?;
        policy.cast_to_storage(&normalized.broadcast_mul(&scale)?)
    }
}
