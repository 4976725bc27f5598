//! Key/value caching for incremental decoding.

pub mod api;
pub mod contiguous;

pub use api::KeyValueCache;
pub use contiguous::LayerKvCache;
