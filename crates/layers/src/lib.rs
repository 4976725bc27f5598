//! Building blocks for DeepSeek-style decoder layers.
//!
//! Everything here is assembled from Candle primitives and shares one
//! [`dtypes::PrecisionPolicy`]: activations live in a storage dtype, matmuls
//! and non-linearities run in a compute dtype, and statistics reduce in `f32`.

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod moe;
pub mod norm;
pub mod residual;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{DenseInit, Linear, LinearConfig};
pub use mlp::{FeedForwardConfig, MlpBlock};
pub use moe::{MoeBlock, MoeConfig, MoeOutput, RoutingScore};
pub use norm::{NormConfig, RmsNorm};
