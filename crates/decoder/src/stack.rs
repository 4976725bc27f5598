//! A stack of decoder layers: `first_num_dense_layers` dense layers followed
//! by MoE layers.
//!
//! With `scan_layers` each homogeneous group is folded through
//! [`DecoderLayer::scan_step`] and its metrics land under `dense_layers/` or
//! `moe_layers/`; otherwise every layer reports under `layers_{i}/`.

use attention::{LayerKvCache, ModelMode};
use candle_core::{Device, Tensor};

use crate::config::DecoderConfig;
use crate::error::{DecoderError, Result};
use crate::layer::{DecoderLayer, FeedForwardKind, LayerOutput};
use crate::metrics::Intermediates;
use crate::sharding::ShardingContext;

#[derive(Debug, Clone)]
pub struct StackOutput {
    pub hidden: Tensor,
    pub intermediates: Intermediates,
}

#[derive(Debug)]
pub struct DecoderStack {
    layers: Vec<DecoderLayer>,
    first_num_dense_layers: usize,
    scan_layers: bool,
    max_target_length: usize,
}

impl DecoderStack {
    pub fn new(config: &DecoderConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let sharding = ShardingContext::from_config(&config.sharding)?;
        let layers = (0..config.num_decoder_layers)
            .map(|index| {
                let kind = if index < config.first_num_dense_layers {
                    FeedForwardKind::Dense
                } else {
                    FeedForwardKind::MixtureOfExperts
                };
                DecoderLayer::new(config, kind, index, sharding.clone(), device)
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "decoder stack init: layers={} dense={} moe={} scan_layers={}",
            layers.len(),
            config.first_num_dense_layers,
            config.num_moe_layers(),
            config.scan_layers
        );
        Ok(Self {
            layers,
            first_num_dense_layers: config.first_num_dense_layers,
            scan_layers: config.scan_layers,
            max_target_length: config.max_target_length,
        })
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// One empty cache per layer.
    pub fn new_caches(&self) -> Vec<LayerKvCache> {
        (0..self.layers.len())
            .map(|_| LayerKvCache::new(self.max_target_length))
            .collect()
    }

    /// Runs every layer in order.
    ///
    /// `caches`, when given, must hold exactly one cache per layer.
    pub fn forward(
        &self,
        inputs: &Tensor,
        segment_ids: Option<&Tensor>,
        positions: &Tensor,
        deterministic: bool,
        mode: ModelMode,
        caches: Option<&mut [LayerKvCache]>,
    ) -> Result<StackOutput> {
        let mut caches = match caches {
            Some(caches) if caches.len() != self.layers.len() => {
                return Err(DecoderError::config(format!(
                    "expected {} layer caches, got {}",
                    self.layers.len(),
                    caches.len()
                )));
            }
            Some(caches) => caches.iter_mut().map(Some).collect::<Vec<_>>(),
            None => (0..self.layers.len()).map(|_| None).collect(),
        };

        let mut intermediates = Intermediates::new();
        let mut hidden = inputs.clone();

        if self.scan_layers {
            let (dense, moe) = self.layers.split_at(self.first_num_dense_layers);
            let (dense_caches, moe_caches) = caches.split_at_mut(self.first_num_dense_layers);
            for (scope, group, group_caches) in [
                ("dense_layers", dense, dense_caches),
                ("moe_layers", moe, moe_caches),
            ] {
                if group.is_empty() {
                    continue;
                }
                let mut sink = Intermediates::new();
                for (layer, cache) in group.iter().zip(group_caches.iter_mut()) {
                    let (carry, _) = layer.scan_step(
                        &hidden,
                        segment_ids,
                        positions,
                        deterministic,
                        mode,
                        cache.as_deref_mut(),
                        &mut sink,
                    )?;
                    hidden = carry;
                }
                intermediates.absorb(scope, sink);
            }
        } else {
            for (layer, cache) in self.layers.iter().zip(caches.iter_mut()) {
                let LayerOutput {
                    hidden: next,
                    intermediates: layer_intermediates,
                } = layer.forward(
                    &hidden,
                    segment_ids,
                    positions,
                    deterministic,
                    mode,
                    cache.as_deref_mut(),
                )?;
                intermediates.absorb(&format!("layers_{}", layer.index()), layer_intermediates);
                hidden = next;
            }
        }

        Ok(StackOutput {
            hidden,
            intermediates,
        })
    }
}
