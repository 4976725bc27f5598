//! Public traits describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Abstract cache capable of storing projected keys and values across steps.
pub trait KeyValueCache {
    /// Append a slice of keys `[b, h, t, qk_dim]`, values `[b, h, t, v_dim]`
    /// and segment ids `[b, t]`.
    fn append(&mut self, keys: &Tensor, values: &Tensor, segment_ids: &Tensor)
        -> Result<(), AttentionError>;

    /// Cached keys, values and segment ids, or `None` when empty.
    fn view(&self) -> Option<(Tensor, Tensor, Tensor)>;

    /// Number of cached positions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached position.
    fn reset(&mut self);
}
