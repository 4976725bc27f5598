//! Rotary positional embeddings.
//!
//! Rotation is applied to tensors shaped `[batch, heads, seq_len, dim]` using a
//! `[batch, seq_len]` tensor of absolute positions, so rows of a batch may sit
//! at different offsets (packed sequences, decode steps). Only the leading
//! `rotate_dim` features are rotated; the tail is passed through untouched.
//!
//! Angles are computed only for the positions a call actually uses, so the
//! cost follows the token count rather than the largest position. The inverse
//! frequency rows are kept in a small process-wide LRU keyed by geometry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use candle_core::{bail, DType, Device, Error, Result, Tensor};

const FREQUENCY_CACHE_CAPACITY: usize = 16;

static FREQUENCY_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static FREQUENCY_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared frequency cache.
pub fn frequency_cache_counters() -> (usize, usize) {
    (
        FREQUENCY_CACHE_HITS.load(Ordering::Relaxed),
        FREQUENCY_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

type Frequencies = Arc<[f64]>;

struct FrequencyCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, Frequencies>,
}

impl FrequencyCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<Frequencies> {
        let value = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: String, value: Frequencies) {
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        if self.entries.len() > self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        self.order.push(key);
    }
}

fn global_frequency_cache() -> &'static Mutex<FrequencyCache> {
    static CACHE: OnceLock<Mutex<FrequencyCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(FrequencyCache::new(FREQUENCY_CACHE_CAPACITY)))
}

/// How rotated feature pairs are laid out inside a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeLayout {
    /// Feature `i` pairs with feature `i + rotate_dim / 2`.
    #[default]
    HalfSplit,
    /// Feature `2i` pairs with feature `2i + 1`.
    Interleaved,
}

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the tensors being rotated.
    pub head_dim: usize,
    /// Base angle θ controlling the frequency spectrum (the "max timescale").
    pub rope_theta: f32,
    /// How many leading dimensions to rotate; `None` rotates the full `head_dim`.
    pub rotate_dim: Option<usize>,
    pub layout: RopeLayout,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
            rotate_dim: None,
            layout: RopeLayout::default(),
        }
    }
}

impl RopeConfig {
    /// Rotary config covering the whole of `head_dim`.
    pub fn new(head_dim: usize, rope_theta: f32) -> Self {
        Self {
            head_dim,
            rope_theta,
            ..Self::default()
        }
    }

    /// Number of rotated features.
    pub fn rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }
}

/// Build a stable cache key from the rotation geometry.
pub fn rope_cache_key(cfg: &RopeConfig) -> String {
    format!("rot={};theta={:.6}", cfg.rotate_dim(), cfg.rope_theta)
}

/// Retrieve (or lazily build) the inverse frequencies `theta^(-2i / rotate_dim)`.
pub fn inverse_frequencies(cfg: &RopeConfig) -> Result<Frequencies> {
    let rotate_dim = cfg.rotate_dim();
    if rotate_dim < 2 || rotate_dim % 2 != 0 {
        bail!("rotate_dim must be even and at least 2, got {rotate_dim}");
    }

    let cache_key = rope_cache_key(cfg);
    let mut guard = global_frequency_cache()
        .lock()
        .map_err(|_| Error::Msg("rope frequency cache lock poisoned".into()))?;
    if let Some(freqs) = guard.get(&cache_key) {
        FREQUENCY_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
        log::debug!("rope frequency cache hit: {}", cache_key);
        return Ok(freqs);
    }
    FREQUENCY_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    log::debug!("rope frequency cache miss: {}", cache_key);

    let base = f64::from(cfg.rope_theta);
    let freqs: Frequencies = (0..rotate_dim / 2)
        .map(|idx| base.powf(-((2 * idx) as f64) / rotate_dim as f64))
        .collect();
    guard.insert(cache_key, freqs.clone());
    Ok(freqs)
}

/// Sine/cosine tables shaped `[positions.len(), rotate_dim / 2]` for exactly `positions`.
///
/// Angles are formed in f64 so large positions keep their precision.
pub fn sin_cos_for_positions(
    positions: &[u32],
    cfg: &RopeConfig,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if positions.is_empty() {
        bail!("rope needs at least one position");
    }
    let freqs = inverse_frequencies(cfg)?;
    let half_dim = freqs.len();
    let mut sin_data = Vec::with_capacity(positions.len() * half_dim);
    let mut cos_data = Vec::with_capacity(positions.len() * half_dim);
    for &pos in positions {
        for &inv_freq in freqs.iter() {
            let angle = f64::from(pos) * inv_freq;
            sin_data.push(angle.sin() as f32);
            cos_data.push(angle.cos() as f32);
        }
    }
    let sin = Tensor::from_vec(sin_data, (positions.len(), half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (positions.len(), half_dim), device)?;
    Ok((sin, cos))
}

/// Rotary positional embedding helper.
#[derive(Debug, Clone, PartialEq)]
pub struct Rope {
    config: RopeConfig,
}

impl Rope {
    /// Validates the geometry and builds the helper.
    pub fn new(config: RopeConfig) -> Result<Self> {
        if config.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        let rotate_dim = config.rotate_dim();
        if rotate_dim == 0 || rotate_dim > config.head_dim {
            bail!(
                "invalid rotate_dim {} for head_dim {}",
                rotate_dim,
                config.head_dim
            );
        }
        if rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even");
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Rotates `x` (`[batch, heads, seq, head_dim]`) by the angles of `positions` (`[batch, seq]`).
    ///
    /// The output keeps the dtype of `x`; the rotation itself runs in f32.
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = x.dims4()?;
        if head_dim != self.config.head_dim {
            bail!(
                "rope expects head_dim {}, got {}",
                self.config.head_dim,
                head_dim
            );
        }
        let (pos_batch, pos_seq) = positions.dims2()?;
        if (pos_batch, pos_seq) != (batch, seq_len) {
            bail!(
                "positions shape [{pos_batch}, {pos_seq}] does not match [batch={batch}, seq={seq_len}]"
            );
        }

        let flat_positions = positions
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        let (sin, cos) = sin_cos_for_positions(&flat_positions, &self.config, x.device())?;

        let rotate_dim = self.config.rotate_dim();
        let half_dim = rotate_dim / 2;
        let gather = |table: &Tensor| -> Result<Tensor> {
            table
                .reshape((batch, 1, seq_len, half_dim))?
                .broadcast_as((batch, heads, seq_len, half_dim))
        };
        let sin = gather(&sin)?;
        let cos = gather(&cos)?;

        let dtype = x.dtype();
        let main = x.narrow(3, 0, rotate_dim)?.to_dtype(DType::F32)?;
        let (first, second) = match self.config.layout {
            RopeLayout::HalfSplit => (
                main.narrow(3, 0, half_dim)?,
                main.narrow(3, half_dim, half_dim)?,
            ),
            RopeLayout::Interleaved => {
                let pairs = main.reshape((batch, heads, seq_len, half_dim, 2))?;
                (
                    pairs.narrow(4, 0, 1)?.squeeze(4)?,
                    pairs.narrow(4, 1, 1)?.squeeze(4)?,
                )
            }
        };

        let rotated_first = first.mul(&cos)?.sub(&second.mul(&sin)?)?;
        let rotated_second = second.mul(&cos)?.add(&first.mul(&sin)?)?;
        let rotated = match self.config.layout {
            RopeLayout::HalfSplit => Tensor::cat(&[&rotated_first, &rotated_second], 3)?,
            RopeLayout::Interleaved => Tensor::stack(&[&rotated_first, &rotated_second], 4)?
                .reshape((batch, heads, seq_len, rotate_dim))?,
        }
        .to_dtype(dtype)?;

        let tail_dim = head_dim - rotate_dim;
        if tail_dim == 0 {
            Ok(rotated)
        } else {
            let tail = x.narrow(3, rotate_dim, tail_dim)?;
            Tensor::cat(&[&rotated, &tail], 3)
        }
    }
}
