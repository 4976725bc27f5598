//! Error type for decoder construction, configuration and execution.

use std::path::PathBuf;

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("invalid decoder configuration: {}", .0.join("; "))]
    Config(Vec<String>),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("attention failed: {0}")]
    Attention(#[from] AttentionError),
    #[error("sharding: {0}")]
    Sharding(String),
}

impl DecoderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(vec![message.into()])
    }

    pub fn sharding(message: impl Into<String>) -> Self {
        Self::Sharding(message.into())
    }
}

pub type Result<T> = std::result::Result<T, DecoderError>;
