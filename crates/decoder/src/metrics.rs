//! Auxiliary values recorded during a forward pass.
//!
//! Values are appended under a name and never overwritten, so a layer that
//! runs several times (or a scanned stack) leaves one entry per call.

use std::collections::BTreeMap;

use candle_core::{DType, Result, Tensor};

/// Summary statistics of an activation, computed in f32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationStats {
    pub mean: f32,
    /// Population standard deviation.
    pub stdev: f32,
    /// Share of elements that are exactly zero.
    pub fraction_zero: f32,
}

impl ActivationStats {
    pub fn compute(tensor: &Tensor) -> Result<Self> {
        let values = tensor.to_dtype(DType::F32)?.flatten_all()?;
        let count = values.elem_count();
        if count == 0 {
            candle_core::bail!("activation statistics need at least one element");
        }
        let mean = values.mean_all()?.to_scalar::<f32>()?;
        let variance = values.affine(1.0, -f64::from(mean))?.sqr()?.mean_all()?.to_scalar::<f32>()?;
        let zeros = values
            .eq(0f32)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        Ok(Self {
            mean,
            stdev: variance.sqrt(),
            fraction_zero: zeros / count as f32,
        })
    }
}

/// Named scalars and checkpoint tensors collected during a forward pass.
#[derive(Debug, Clone, Default)]
pub struct Intermediates {
    scalars: BTreeMap<String, Vec<f32>>,
    checkpoints: BTreeMap<String, Vec<Tensor>>,
}

impl Intermediates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.checkpoints.is_empty()
    }

    pub fn sow(&mut self, name: impl Into<String>, value: f32) {
        self.scalars.entry(name.into()).or_default().push(value);
    }

    pub fn save_checkpoint(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.checkpoints.entry(name.into()).or_default().push(tensor);
    }

    pub fn record_activation_stats(&mut self, stats: &ActivationStats) {
        self.sow("activation_mean", stats.mean);
        self.sow("activation_stdev", stats.stdev);
        self.sow("activation_fraction_zero", stats.fraction_zero);
    }

    pub fn scalar(&self, name: &str) -> Option<&[f32]> {
        self.scalars.get(name).map(Vec::as_slice)
    }

    pub fn checkpoint(&self, name: &str) -> Option<&[Tensor]> {
        self.checkpoints.get(name).map(Vec::as_slice)
    }

    pub fn scalars(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.scalars.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn checkpoint_names(&self) -> impl Iterator<Item = &str> {
        self.checkpoints.keys().map(String::as_str)
    }

    /// Appends every entry of `child` under the same name.
    pub fn absorb_flat(&mut self, child: Intermediates) {
        for (name, values) in child.scalars {
            self.scalars.entry(name).or_default().extend(values);
        }
        for (name, tensors) in child.checkpoints {
            self.checkpoints.entry(name).or_default().extend(tensors);
        }
    }

    /// Appends every entry of `child` under `scope/name`.
    pub fn absorb(&mut self, scope: &str, child: Intermediates) {
        for (name, values) in child.scalars {
            self.scalars
                .entry(format!("{scope}/{name}"))
                .or_default()
                .extend(values);
        }
        for (name, tensors) in child.checkpoints {
            self.checkpoints
                .entry(format!("{scope}/{name}"))
                .or_default()
                .extend(tensors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn stats_match_population_formulas() -> Result<()> {
        let x = Tensor::new(&[[0f32, 2.0], [4.0, 0.0]], &Device::Cpu)?;
        let stats = ActivationStats::compute(&x)?;
        assert!((stats.mean - 1.5).abs() < 1e-6);
        // population variance: (2.25 + 0.25 + 6.25 + 2.25) / 4 = 2.75
        assert!((stats.stdev - 2.75f32.sqrt()).abs() < 1e-6);
        assert!((stats.fraction_zero - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn stats_handle_half_precision() -> Result<()> {
        let x = Tensor::new(&[1f32, 1.0, 1.0, 0.0], &Device::Cpu)?.to_dtype(DType::BF16)?;
        let stats = ActivationStats::compute(&x)?;
        assert!((stats.mean - 0.75).abs() < 1e-3);
        assert!((stats.fraction_zero - 0.25).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn sow_appends_and_absorb_scopes() {
        let mut layer = Intermediates::new();
        layer.sow("activation_mean", 1.0);
        layer.sow("activation_mean", 2.0);
        assert_eq!(layer.scalar("activation_mean"), Some(&[1.0, 2.0][..]));

        let mut root = Intermediates::new();
        root.absorb("moe_layers", layer.clone());
        root.absorb("moe_layers", layer);
        assert_eq!(
            root.scalar("moe_layers/activation_mean"),
            Some(&[1.0, 2.0, 1.0, 2.0][..])
        );
        assert!(root.scalar("activation_mean").is_none());
    }

    #[test]
    fn checkpoints_are_scoped_by_layer() -> Result<()> {
        let mut layer = Intermediates::new();
        layer.save_checkpoint("decoder_layer_input", Tensor::zeros(2, DType::F32, &Device::Cpu)?);
        let mut root = Intermediates::new();
        root.absorb("layers_0", layer.clone());
        root.absorb("layers_1", layer);
        let mut names: Vec<&str> = root.checkpoint_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["layers_0/decoder_layer_input", "layers_1/decoder_layer_input"]);
        Ok(())
    }
}
