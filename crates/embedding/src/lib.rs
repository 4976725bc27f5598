//! Embedding crate
//!
//! The positional module exposes rotary position embeddings driven by explicit
//! per-token positions, so packed and offset sequences rotate correctly.

pub mod positional;

pub use positional::rope::{Rope, RopeConfig, RopeLayout};
