//! Dense projections and their variance-scaling initialisers.
//!
//! Linear layers accept `(batch, seq, in_dim)` or `(rows, in_dim)` inputs and
//! return the same leading layout with `out_dim` features. Fused variants pack
//! several projections side by side as `(.., num_projections * output_dim)` so
//! gated MLPs can run one matmul and split afterwards. Weights are stored as
//! `(out, in)` in the weight dtype, promoted to [`PrecisionPolicy::compute`]
//! for the matmul, and the result is left in the compute dtype.

use candle_core::{DType, Device, Error, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a bias-free single projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
            fused_projections: 1,
        }
    }

    /// Creates `count` bias-free projections fused into one matmul.
    pub fn fused(input_dim: usize, output_dim: usize, count: usize) -> Self {
        Self {
            fused_projections: count,
            ..Self::new(input_dim, output_dim)
        }
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Sampling distribution used by [`DenseInit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitDistribution {
    /// Normal truncated at two standard deviations, rescaled to keep the target variance.
    TruncatedNormal,
    /// Plain normal.
    Normal,
    /// Uniform over `[-sqrt(3 * variance), sqrt(3 * variance)]`.
    Uniform,
}

/// Fan-in variance scaling initialiser: `variance = scale / fan_in`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenseInit {
    pub scale: f64,
    pub distribution: InitDistribution,
    pub seed: u64,
}

// Standard deviation of a unit normal truncated to [-2, 2].
const TRUNCATED_NORMAL_STDDEV: f64 = 0.879_625_661_034_239_8;

impl DenseInit {
    /// Truncated-normal fan-in initialiser with the given scale.
    pub fn truncated_normal(scale: f64, seed: u64) -> Self {
        Self {
            scale,
            distribution: InitDistribution::TruncatedNormal,
            seed,
        }
    }

    /// Same distribution with a different seed.
    pub fn with_seed(&self, seed: u64) -> Self {
        Self { seed, ..*self }
    }

    /// Samples an `(out_dim, in_dim)` kernel in `dtype`.
    pub fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        if in_dim == 0 {
            return Err(Error::Msg("fan_in must be non-zero".into()));
        }
        let variance = self.scale / in_dim as f64;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let total = out_dim * in_dim;
        let mut data = Vec::with_capacity(total);
        match self.distribution {
            InitDistribution::TruncatedNormal => {
                let std = variance.sqrt() / TRUNCATED_NORMAL_STDDEV;
                while data.len() < total {
                    let z: f64 = rng.sample(StandardNormal);
                    if z.abs() <= 2.0 {
                        data.push((z * std) as f32);
                    }
                }
            }
            InitDistribution::Normal => {
                let std = variance.sqrt();
                for _ in 0..total {
                    data.push((rng.sample::<f64, _>(StandardNormal) * std) as f32);
                }
            }
            InitDistribution::Uniform => {
                let limit = (3.0 * variance).sqrt();
                for _ in 0..total {
                    data.push(rng.gen_range(-limit..limit) as f32);
                }
            }
        }
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", &weight, &checks::FLOAT_DTYPES)?;
        match (config.bias, &bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_same_dtype("linear.bias", tensor, "linear.weight", &weight)?;
            }
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with weights drawn from `init`; biases start at zero.
    pub fn with_init(
        config: LinearConfig,
        init: &DenseInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// The `(out, in)` kernel.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Applies the projection; the result stays in the compute dtype.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let out_dim = self.config.total_output_dim();

        let mut output = match input.dims() {
            &[batch, seq, in_dim] if in_dim == self.config.input_dim => input
                .reshape((batch * seq, in_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, out_dim))?,
            &[_, in_dim] if in_dim == self.config.input_dim => input.matmul(&weight_t)?,
            dims => {
                return Err(Error::Msg(format!(
                    "linear expects input shaped [B, T, {}] or [N, {}], got {dims:?}",
                    self.config.input_dim, self.config.input_dim
                )))
            }
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }
        Ok(output)
    }
}
