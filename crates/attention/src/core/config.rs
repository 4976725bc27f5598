//! Per-call knobs shared by all attention kernels.

/// Configuration driving a single attention call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Multiplier applied to `q · k`; defaults to `1 / sqrt(head_dim)`.
    pub scale: Option<f32>,
}

impl Config {
    /// Config with an explicit softmax scale.
    pub fn with_scale(scale: f32) -> Self {
        Self {
            scale: Some(scale),
            ..Self::default()
        }
    }

    /// Enables dropout with `p` unless the call is deterministic.
    pub fn with_dropout(mut self, p: f32, deterministic: bool) -> Self {
        self.dropout_p = if deterministic || p <= 0.0 { None } else { Some(p) };
        self
    }
}
