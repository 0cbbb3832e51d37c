//! # TierKV Local Engine
//!
//! Purpose: Provide the in-process TTL cache used when the remote store is
//! unreachable, with a background sweeper that enforces expiry.
//!
//! ## Design Principles
//! 1. **Concurrent Map**: Entries live in a sharded `DashMap`; no global lock.
//! 2. **Lazy + Active Expiry**: Reads hide expired entries, the sweeper frees them.
//! 3. **Policy Driven**: `SweepPolicy` picks hard-expiry only or near-expiry shedding.

mod config;
mod memory;

pub use config::{LocalCacheConfig, SweepPolicy};
pub use memory::{LocalCache, SweepReport};
