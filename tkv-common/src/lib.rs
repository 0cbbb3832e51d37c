// tkv-common - Shared types and primitives for TierKV
//
// This crate defines the error type, the TTL value type, and the cooperative
// background task used by the pool, cache, and facade sweepers.

pub mod error;
pub mod task;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use task::*;
pub use types::*;
