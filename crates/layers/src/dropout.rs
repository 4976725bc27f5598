//! Seeded dropout shared by feed-forward and attention paths.
//!
//! Dropout only fires when the caller passes `deterministic = false`. Masks
//! are drawn from a per-module [`StdRng`] so a fixed seed reproduces the same
//! sequence of masks across runs.

use std::{fmt, sync::Mutex};

use candle_core::{Error, Result, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn check_probability(probability: f32) -> Result<()> {
    if !(0.0..1.0).contains(&probability) {
        return Err(Error::Msg(format!(
            "dropout probability must be in [0, 1), got {probability}"
        )));
    }
    Ok(())
}

/// Seeded source of inverted dropout masks.
///
/// The probability is supplied per call so attention kernels can share the
/// same mask path as [`Dropout`].
pub struct MaskStream {
    rng: Mutex<StdRng>,
}

impl MaskStream {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Zeroes elements with `probability` and rescales survivors by `1 / (1 - p)`.
    pub fn apply(&self, input: &Tensor, probability: f32) -> Result<Tensor> {
        check_probability(probability)?;
        if probability <= 0.0 {
            return Ok(input.clone());
        }
        let keep_prob = 1.0 - probability;
        let scale = 1.0 / keep_prob;
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
        let mask_data: Vec<f32> = (0..input.elem_count())
            .map(|_| if rng.gen::<f32>() < keep_prob { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask_data, input.dims().to_vec(), input.device())?
            .to_dtype(input.dtype())?;
        input.mul(&mask)
    }
}

impl fmt::Debug for MaskStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskStream").finish_non_exhaustive()
    }
}

impl Clone for MaskStream {
    fn clone(&self) -> Self {
        let state = match self.rng.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Self {
            rng: Mutex::new(state),
        }
    }
}

/// Inverted dropout with a deterministic mask stream.
#[derive(Debug, Clone)]
pub struct Dropout {
    probability: f32,
    masks: MaskStream,
}

impl Dropout {
    /// Builds a dropout module; probabilities outside `[0, 1)` are rejected.
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        check_probability(probability)?;
        Ok(Self {
            probability,
            masks: MaskStream::new(seed),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Zeroes elements with the configured probability and rescales survivors.
    ///
    /// Returns `input` untouched when `deterministic` or the probability is zero.
    pub fn forward(&self, input: &Tensor, deterministic: bool) -> Result<Tensor> {
        if deterministic {
            return Ok(input.clone());
        }
        self.masks.apply(input, self.probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn dropout_preserves_expectation() -> Result<()> {
        let dropout = Dropout::new(0.25, 123)?;
        let input = Tensor::ones((4, 8, 16), DType::F32, &Device::Cpu)?;
        let dropped = dropout.forward(&input, false)?;
        let values = dropped.flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!((mean - 1.0).abs() < 0.1);
        assert!(values.iter().any(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn deterministic_calls_are_identity() -> Result<()> {
        let dropout = Dropout::new(0.5, 0)?;
        let input = Tensor::randn(0f32, 1.0, (2, 2, 4), &Device::Cpu)?;
        let out = dropout.forward(&input, true)?;
        let diff = input.sub(&out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn equal_seeds_give_equal_masks() -> Result<()> {
        let a = Dropout::new(0.5, 9)?;
        let b = Dropout::new(0.5, 9)?;
        let input = Tensor::ones(64, DType::F32, &Device::Cpu)?;
        assert_eq!(
            a.forward(&input, false)?.to_vec1::<f32>()?,
            b.forward(&input, false)?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn mask_streams_follow_their_seed() -> Result<()> {
        let input = Tensor::ones(128, DType::F32, &Device::Cpu)?;
        let a = MaskStream::new(3).apply(&input, 0.3)?.to_vec1::<f32>()?;
        let b = MaskStream::new(3).apply(&input, 0.3)?.to_vec1::<f32>()?;
        let c = MaskStream::new(4).apply(&input, 0.3)?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(MaskStream::new(0).apply(&input, 1.0).is_err());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_probability() {
        assert!(Dropout::new(1.0, 0).is_err());
        assert!(Dropout::new(-0.1, 0).is_err());
    }
}
