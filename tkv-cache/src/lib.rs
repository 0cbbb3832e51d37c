//! # TierKV
//!
//! Purpose: Two-tier key-value caching. Values go to a remote RESP store
//! while it answers pings and to an in-process TTL cache while it does not.
//!
//! ## Usage
//!
//! - Build a `TieredCache` and pass it around, or
//! - call `configure` once and reach the shared instance through `global`.

mod facade;

use std::sync::Arc;

use parking_lot::RwLock;

pub use facade::{CacheValue, RemoteStore, TieredCache, DEFAULT_PROBE_INTERVAL};
pub use tkv_client::{Client, ClientError, ClientResult, Json, RemoteOptions};
pub use tkv_engine::{LocalCache, LocalCacheConfig, SweepPolicy};

static GLOBAL: RwLock<Option<Arc<TieredCache>>> = RwLock::new(None);

/// Installs the process-wide cache, disposing any previous one.
pub fn configure(remote: Option<RemoteOptions>) -> Arc<TieredCache> {
    let cache = Arc::new(TieredCache::configure(remote));
    let previous = GLOBAL.write().replace(Arc::clone(&cache));
    if let Some(previous) = previous {
        previous.dispose();
    }
    cache
}

/// Returns the process-wide cache, if one was configured.
pub fn global() -> Option<Arc<TieredCache>> {
    GLOBAL.read().clone()
}

/// Disposes and removes the process-wide cache.
pub fn dispose() {
    let current = GLOBAL.write().take();
    if let Some(cache) = current {
        cache.dispose();
    }
}
