//! Residual additions with mixed-precision aware promotion.
//!
//! Both operands follow `(batch, seq, hidden)`. The sum is computed in
//! [`PrecisionPolicy::compute`] and cast back to storage so half precision
//! activations do not lose the small branch update.

use candle_core::{Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Adds `branch` onto `residual` and returns the result in storage dtype.
pub fn residual_add(branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    checks::expect_rank("residual.input", residual, 3)?;
    checks::expect_shape("residual.branch", branch, residual.dims())?;
    let branch = policy.cast_for_matmul(branch)?;
    let residual = policy.cast_for_matmul(residual)?;
    policy.cast_to_storage(&branch.add(&residual)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn residual_add_preserves_shape_and_dtype() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::for_activations(DType::F16);
        let left = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?.to_dtype(DType::F16)?;
        let right = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?;
        let out = residual_add(&right, &left, &policy)?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(out.dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::for_activations(DType::F32);
        let a = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        let b = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        assert!(residual_add(&a, &b, &policy).is_err());
        Ok(())
    }
}
