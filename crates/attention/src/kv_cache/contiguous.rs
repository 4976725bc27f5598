//! Single-buffer key/value cache for one attention layer.
//!
//! Keys are stored as `[batch, heads, len, qk_head_dim]`, values as
//! `[batch, heads, len, v_head_dim]` and segment ids as `[batch, len]`. Appends
//! concatenate along the sequence axis; the total length is bounded by
//! `max_len`.

use candle_core::{DType, Tensor};

use crate::core::AttentionError;
use crate::kv_cache::api::KeyValueCache;

#[derive(Debug, Clone)]
struct Entries {
    keys: Tensor,
    values: Tensor,
    segment_ids: Tensor,
}

/// Contiguous cache bounded by `max_len` positions.
#[derive(Debug, Clone)]
pub struct LayerKvCache {
    max_len: usize,
    entries: Option<Entries>,
}

impl LayerKvCache {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            entries: None,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Dtype of the cached projections, if any.
    pub fn dtype(&self) -> Option<DType> {
        self.entries.as_ref().map(|e| e.keys.dtype())
    }
}

impl KeyValueCache for LayerKvCache {
    fn append(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        segment_ids: &Tensor,
    ) -> Result<(), AttentionError> {
        let (kb, kh, k_len, _) = keys.dims4()?;
        let (vb, vh, v_len, _) = values.dims4()?;
        let (sb, s_len) = segment_ids.dims2()?;
        if (kb, kh, k_len) != (vb, vh, v_len) || (sb, s_len) != (kb, k_len) {
            return Err(AttentionError::shape(format!(
                "cache append: keys {:?}, values {:?} and segment ids {:?} disagree",
                keys.dims(),
                values.dims(),
                segment_ids.dims()
            )));
        }
        let total = self.len() + k_len;
        if total > self.max_len {
            return Err(AttentionError::cache(format!(
                "appending {k_len} positions would exceed capacity {} (cached {})",
                self.max_len,
                self.len()
            )));
        }

        let segment_ids = segment_ids.to_dtype(DType::I64)?;
        let next = match self.entries.take() {
            None => Entries {
                keys: keys.contiguous()?,
                values: values.contiguous()?,
                segment_ids,
            },
            Some(prev) => {
                if prev.keys.dims()[..2] != keys.dims()[..2] || prev.keys.dtype() != keys.dtype() {
                    let message = format!(
                        "cache holds {:?} {:?}, got {:?} {:?}",
                        prev.keys.dims(),
                        prev.keys.dtype(),
                        keys.dims(),
                        keys.dtype()
                    );
                    self.entries = Some(prev);
                    return Err(AttentionError::cache(message));
                }
                Entries {
                    keys: Tensor::cat(&[&prev.keys, keys], 2)?,
                    values: Tensor::cat(&[&prev.values, values], 2)?,
                    segment_ids: Tensor::cat(&[&prev.segment_ids, &segment_ids], 1)?,
                }
            }
        };
        log::debug!("kv-cache append: +{} -> {} / {}", k_len, total, self.max_len);
        self.entries = Some(next);
        Ok(())
    }

    fn view(&self) -> Option<(Tensor, Tensor, Tensor)> {
        self.entries
            .as_ref()
            .map(|e| (e.keys.clone(), e.values.clone(), e.segment_ids.clone()))
    }

    fn len(&self) -> usize {
        self.entries
            .as_ref()
            .and_then(|e| e.keys.dims().get(2).copied())
            .unwrap_or(0)
    }

    fn reset(&mut self) {
        self.entries = None;
    }
}
