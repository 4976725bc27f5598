//! Reference attention kernel used by every layer in the workspace.

pub mod exact;

pub use exact::ExactAttention;
