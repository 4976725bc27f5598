//! DeepSeek-style decoder layers on Candle.
//!
//! A [`DecoderLayer`] wires multi-head latent attention and either a dense
//! gated MLP or a shared-plus-routed expert block into the pre-norm residual
//! layout, checks every activation against logical sharding annotations and
//! optionally records activation statistics. [`DecoderStack`] chains dense and
//! MoE layers and drives per-layer key/value caches.

pub mod config;
pub mod error;
pub mod layer;
pub mod metrics;
pub mod sharding;
pub mod stack;

pub use attention::{LayerKvCache, ModelMode};
pub use config::{DecoderConfig, RematPolicy};
pub use error::{DecoderError, Result};
pub use layer::{DecoderLayer, FeedForwardKind, LayerOutput, DECODER_LAYER_INPUT};
pub use metrics::{ActivationStats, Intermediates};
pub use sharding::{AxisRule, AxisRules, DeviceMesh, MeshAxis, PartitionSpec, ShardingConfig, ShardingContext};
pub use stack::{DecoderStack, StackOutput};
