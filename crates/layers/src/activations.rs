//! Activation catalogue for gated feed-forward stacks.
//!
//! Feed-forward blocks describe their gating with an ordered list of
//! activation names such as `["silu", "linear"]`: one projection chunk per
//! entry, each chunk passed through its activation, and the chunks multiplied
//! together. Activations evaluate in [`PrecisionPolicy::compute`] and leave the
//! result in that dtype; the enclosing block decides when to cast back.
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU** computes `x * sigmoid(x)` via the fused Candle kernel.
//! * **linear** is the identity and marks the ungated branch.

use std::{fmt, str::FromStr};

use candle_core::{Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Non-linearity applied to one projection chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Identity, written `linear` in configs.
    Linear,
    /// Standard SiLU (a.k.a. swish).
    Silu,
    /// Erf-based GELU.
    Gelu,
    /// Rectified linear unit.
    Relu,
}

impl ActivationKind {
    /// Applies the activation in the compute dtype of `policy`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        match self {
            ActivationKind::Linear => Ok(compute),
            ActivationKind::Silu => compute.silu(),
            ActivationKind::Gelu => compute.gelu_erf(),
            ActivationKind::Relu => compute.relu(),
        }
    }

    /// Name used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Linear => "linear",
            ActivationKind::Silu => "silu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Relu => "relu",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActivationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "identity" => Ok(ActivationKind::Linear),
            "silu" | "swish" => Ok(ActivationKind::Silu),
            "gelu" => Ok(ActivationKind::Gelu),
            "relu" => Ok(ActivationKind::Relu),
            other => Err(Error::Msg(format!("unknown activation '{other}'"))),
        }
    }
}

/// Parses an ordered activation list, rejecting empty lists.
pub fn parse_activations<S: AsRef<str>>(names: &[S]) -> Result<Vec<ActivationKind>> {
    if names.is_empty() {
        return Err(Error::Msg("activation list must not be empty".into()));
    }
    names.iter().map(|name| name.as_ref().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::for_activations(DType::F32);
        let output = ActivationKind::Gelu.forward(&input, &policy)?;

        let scaled = input.affine(1.0 / SQRT_2, 0.0)?;
        let inner = (scaled.erf()? + 1.0)?;
        let reference = input.affine(0.5, 0.0)?.mul(&inner)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn silu_matches_swish_reference() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, -1.0, 0.0, 0.5, 2.0], (5,), &device)?;
        let policy = PrecisionPolicy::for_activations(DType::F32);
        let output = ActivationKind::Silu.forward(&input, &policy)?;

        let denom = (input.neg()?.exp()? + 1.0)?;
        let reference = input.div(&denom)?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn linear_promotes_half_precision_without_changing_values() -> Result<()> {
        let input = Tensor::new(&[1.5f32, -2.0], &Device::Cpu)?.to_dtype(DType::BF16)?;
        let policy = PrecisionPolicy::for_activations(DType::BF16);
        let output = ActivationKind::Linear.forward(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F32);
        assert_eq!(output.to_vec1::<f32>()?, vec![1.5, -2.0]);
        Ok(())
    }

    #[test]
    fn parses_config_names() -> Result<()> {
        let kinds = parse_activations(&["silu", "linear"])?;
        assert_eq!(kinds, vec![ActivationKind::Silu, ActivationKind::Linear]);
        assert!(parse_activations::<&str>(&[]).is_err());
        assert!("tanh".parse::<ActivationKind>().is_err());
        Ok(())
    }
}
