//! Portable exact attention kernel.
//!
//! Scores, softmax and the value reduction all run in `f32`; the result is
//! cast back to the dtype of `q`.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::dropout::MaskStream;

use crate::core::{Attention, AttentionError, Config};
use crate::masks::MASK_DTYPE;

/// Numerically stable, portable attention kernel.
///
/// Attention-weight dropout draws its masks from a seeded stream, so two
/// kernels built with the same seed drop the same weights.
#[derive(Debug)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
    masks: MaskStream,
}

impl Default for ExactAttention {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel whose dropout masks follow `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            first_call: OnceLock::new(),
            masks: MaskStream::new(seed),
        }
    }
}

fn validate_mask(
    mask: &Tensor,
    q: &Tensor,
    dims: (usize, usize, usize, usize),
) -> Result<(), AttentionError> {
    let (batch, heads, q_len, k_len) = dims;
    if !q.device().same_device(mask.device()) {
        return Err(AttentionError::shape("mask must reside on the same device as q"));
    }
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
        });
    }
    let (mb, mh, mq, mk) = mask
        .dims4()
        .map_err(|_| AttentionError::shape("mask must have shape [batch, heads|1, q_len, k_len]"))?;
    if mb != batch || mq != q_len || mk != k_len || (mh != 1 && mh != heads) {
        return Err(AttentionError::shape(format!(
            "mask shape mismatch: expected [{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
        )));
    }
    Ok(())
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dropout={:?} scale={:?}",
                config.dropout_p,
                config.scale
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]"))?;
        let (kb, kh, k_len, kd) = k
            .dims4()
            .map_err(|_| AttentionError::shape("k must have shape [batch, heads, seq_len, head_dim]"))?;
        let (vb, vh, vk, v_dim) = v
            .dims4()
            .map_err(|_| AttentionError::shape("v must have shape [batch, heads, seq_len, v_dim]"))?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got [{vb}, {vh}, {vk}, {v_dim}]"
            )));
        }

        let merged = batch * heads;
        let q_view = q.to_dtype(DType::F32)?.reshape((merged, q_len, head_dim))?;
        let k_view = k.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;
        let v_view = v.to_dtype(DType::F32)?.reshape((merged, k_len, v_dim))?;

        let scale = config
            .scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());
        let scores = q_view
            .matmul(&k_view.t()?.contiguous()?)?
            .affine(f64::from(scale), 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        let scores = match mask {
            Some(mask) => {
                validate_mask(mask, q, (batch, heads, q_len, k_len))?;
                scores.broadcast_add(mask)?
            }
            None => scores,
        };

        let probs = softmax_last_dim(&scores.reshape((merged, q_len, k_len))?)?;
        let probs = match config.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => {
                return Err(AttentionError::shape(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            Some(p) if p > 0.0 => self.masks.apply(&probs, p)?,
            _ => probs,
        };

        let output = probs
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, v_dim))?;
        Ok(output.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_mask;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device, v_dim: usize) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data, (1, 2, 4, 8), device)?.affine(-0.5, 0.1)?;
        let v_data: Vec<f32> = (0..(2 * 4 * v_dim)).map(|i| ((i % 7) as f32) * 0.2).collect();
        let v = Tensor::from_vec(v_data, (1, 2, 4, v_dim), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        scale: f32,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, v_dim) = v.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * v_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };

        for b in 0..batch {
            for h in 0..heads {
                for qi in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for (ki, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            dot += q_vec[((b * heads + h) * q_len + qi) * head_dim + d]
                                * k_vec[((b * heads + h) * k_len + ki) * head_dim + d];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            // masks are [batch, 1, q, k]
                            dot += mask_vec[(b * q_len + qi) * k_len + ki];
                        }
                        *slot = dot;
                        if dot > max_val {
                            max_val = dot;
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        *val = if *val == f32::NEG_INFINITY { 0.0 } else { (*val - max_val).exp() };
                        denom += *val;
                    }
                    for d in 0..v_dim {
                        let mut acc = 0f32;
                        for (ki, weight) in row.iter().enumerate() {
                            acc += weight / denom * v_vec[((b * heads + h) * k_len + ki) * v_dim + d];
                        }
                        output[((b * heads + h) * q_len + qi) * v_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, v_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 8)?;
        let mask = build_causal_mask(&device, 1, 4, 4)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let expected = naive_attention(&q, &k, &v, Some(&mask), 1.0 / 8f32.sqrt())?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn value_width_may_differ_from_query_width() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 5)?;
        let config = Config::with_scale(0.3);
        let output = ExactAttention::new()
            .attend(&q, &k, &v, None, &config)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        assert_eq!(output.dims(), &[1, 2, 4, 5]);
        let expected = naive_attention(&q, &k, &v, None, 0.3)?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device)?;
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let err = ExactAttention::new().attend(&q, &k, &v, None, &Config::default());
        assert!(matches!(err, Err(AttentionError::InvalidShape { .. })));
        Ok(())
    }

    #[test]
    fn mask_shape_validation() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device)?;
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device)?;
        let err = ExactAttention::new().attend(&q, &q, &q, Some(&mask), &Config::default());
        assert!(matches!(err, Err(AttentionError::InvalidShape { .. })));
        Ok(())
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 8)?;
        let mask = build_causal_mask(&device, 1, 4, 4)?;
        let attention = ExactAttention::new();
        let reference = attention
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = attention
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    Some(&mask),
                    &Config::default(),
                )
                .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn deterministic_calls_skip_dropout() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 8)?;
        let attention = ExactAttention::new();
        let config = Config::default().with_dropout(0.5, true);
        assert_eq!(config.dropout_p, None);
        let a = attention
            .attend(&q, &k, &v, None, &config)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let b = attention
            .attend(&q, &k, &v, None, &Config::default())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        assert!(max_diff(&a, &b)? < 1e-6);
        Ok(())
    }

    #[test]
    fn seeded_dropout_is_reproducible() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 8)?;
        let config = Config::default().with_dropout(0.5, false);
        let run = |seed: u64| -> CandleResult<Tensor> {
            ExactAttention::with_seed(seed)
                .attend(&q, &k, &v, None, &config)
                .map_err(|e| candle_core::Error::Msg(e.to_string()))
        };
        let a = run(21)?;
        let b = run(21)?;
        let c = run(22)?;
        assert_eq!(max_diff(&a, &b)?, 0.0);
        assert!(max_diff(&a, &c)? > 0.0);
        Ok(())
    }

    #[test]
    fn invalid_dropout_probability_is_rejected() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 8)?;
        let config = Config {
            dropout_p: Some(1.5),
            ..Config::default()
        };
        assert!(ExactAttention::new().attend(&q, &k, &v, None, &config).is_err());
        Ok(())
    }
}
