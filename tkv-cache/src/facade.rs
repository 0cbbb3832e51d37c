//! # Tiered Cache Facade
//!
//! Purpose: Serve reads and writes from the remote store while it is healthy
//! and fall back to the local TTL cache the moment it is not.
//!
//! ## Design Principles
//! 1. **Remote First, Never Fail Over Loudly**: Remote errors are logged, flip
//!    the health flag and fall through to the local cache; callers only see
//!    a `bool` or an `Option`.
//! 2. **Probe Restores Health**: Only the periodic ping turns the flag back on.
//! 3. **Explicit Context**: A `TieredCache` is a value; the process-wide
//!    default in the crate root is optional.
//!
//! ## Flow
//!
//! ```text
//! try_set/try_get ─► healthy? ─yes─► remote ─ok─► done
//!                        │              │ err
//!                        │ no           ▼
//!                        └────────► flag = false ─► local cache
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use tkv_client::{Client, ClientError, ClientResult, FromReply, RemoteOptions, ToArg};
use tkv_common::{PeriodicTask, TaskHandle};
use tkv_engine::{LocalCache, LocalCacheConfig};

/// Default interval between health probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Values that can live in either tier.
pub trait CacheValue:
    ToArg + FromReply + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

impl<T> CacheValue for T where
    T: ToArg + FromReply + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

/// The remote tier as seen by the facade.
pub trait RemoteStore: Send + Sync + 'static {
    fn ping(&self) -> ClientResult<bool>;

    /// Stores a value; `ttl <= 0` means no expiry.
    fn set<V: CacheValue>(&self, key: &str, value: &V, ttl: i64) -> ClientResult<bool>;

    fn get<T: CacheValue>(&self, key: &str) -> ClientResult<Option<T>>;

    /// Releases sockets and background work. Default: nothing to release.
    fn close(&self) {}
}

impl RemoteStore for Client {
    fn ping(&self) -> ClientResult<bool> {
        Client::ping(self)
    }

    fn set<V: CacheValue>(&self, key: &str, value: &V, ttl: i64) -> ClientResult<bool> {
        Client::set(self, key, value, ttl)
    }

    fn get<T: CacheValue>(&self, key: &str) -> ClientResult<Option<T>> {
        Client::get(self, key)
    }

    fn close(&self) {
        Client::close(self)
    }
}

struct Health {
    healthy: AtomicBool,
}

impl Health {
    fn set(&self, healthy: bool, reason: &str) {
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if was && !healthy {
            tracing::warn!(reason, "remote store unhealthy; serving from local cache");
        } else if !was && healthy {
            tracing::info!("remote store healthy");
        }
    }
}

/// Two-tier cache: remote store when healthy, local TTL cache otherwise.
pub struct TieredCache<R: RemoteStore = Client> {
    local: LocalCache,
    remote: Option<Arc<R>>,
    health: Arc<Health>,
    probe: Mutex<Option<TaskHandle>>,
}

impl<R: RemoteStore> TieredCache<R> {
    /// Builds a cache with no remote tier.
    pub fn local_only(local_config: LocalCacheConfig) -> Self {
        TieredCache {
            local: LocalCache::with_config(local_config),
            remote: None,
            health: Arc::new(Health {
                healthy: AtomicBool::new(false),
            }),
            probe: Mutex::new(None),
        }
    }

    /// Builds a cache over `remote` and starts the health probe.
    ///
    /// The remote starts out unhealthy; the first probe runs immediately.
    pub fn with_remote(remote: R, local_config: LocalCacheConfig, probe_interval: Duration) -> Self {
        let mut cache = Self::local_only(local_config);
        let remote = Arc::new(remote);

        let probe_remote = Arc::clone(&remote);
        let health = Arc::clone(&cache.health);
        let probe = PeriodicTask::spawn("tkv-health-probe", probe_interval, move || {
            match probe_remote.ping() {
                Ok(true) => health.set(true, "ping"),
                Ok(false) => health.set(false, "ping returned false"),
                Err(err) => health.set(false, err.kind()),
            }
        });

        cache.remote = Some(remote);
        *cache.probe.lock() = Some(probe);
        cache
    }

    /// Stores `value`; true when either tier accepted it.
    pub fn try_set<T: CacheValue>(&self, key: &str, value: T, ttl: i64) -> bool {
        if let Some(remote) = self.healthy_remote() {
            match remote.set(key, &value, ttl) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => self.remote_failed("set", key, &err),
            }
        }

        match self.local.set(key, value, ttl, true) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::warn!(key, error = %err, "local cache rejected value");
                false
            }
        }
    }

    /// Reads `key`; `None` when missing or unreadable in the serving tier.
    pub fn try_get<T: CacheValue>(&self, key: &str) -> Option<T> {
        if let Some(remote) = self.healthy_remote() {
            match remote.get::<T>(key) {
                Ok(value) => return value,
                Err(err) => self.remote_failed("get", key, &err),
            }
        }

        match self.local.get::<T>(key) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "local cache read failed");
                None
            }
        }
    }

    pub fn is_remote_healthy(&self) -> bool {
        self.remote.is_some() && self.health.healthy.load(Ordering::Acquire)
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn remote(&self) -> Option<&R> {
        self.remote.as_deref()
    }

    /// Stops the probe, closes the remote tier and empties the local one.
    pub fn dispose(&self) {
        if let Some(probe) = self.probe.lock().take() {
            probe.stop();
        }
        self.health.healthy.store(false, Ordering::Release);
        if let Some(remote) = &self.remote {
            remote.close();
        }
        self.local.stop_sweeper();
        self.local.clear();
    }

    fn healthy_remote(&self) -> Option<&R> {
        if self.health.healthy.load(Ordering::Acquire) {
            self.remote.as_deref()
        } else {
            None
        }
    }

    fn remote_failed(&self, op: &str, key: &str, err: &ClientError) {
        tracing::warn!(op, key, kind = err.kind(), error = %err, "remote call failed");
        self.health.set(false, err.kind());
    }
}

impl TieredCache<Client> {
    /// Builds the standard setup: a JSON-mode local cache, plus a remote
    /// client and health probe when `remote` is given.
    pub fn configure(remote: Option<RemoteOptions>) -> Self {
        let local_config = LocalCacheConfig {
            json_serialize: true,
            ..LocalCacheConfig::default()
        };
        match remote {
            Some(options) => Self::with_remote(Client::new(options), local_config, DEFAULT_PROBE_INTERVAL),
            None => Self::local_only(local_config),
        }
    }
}

impl<R: RemoteStore> Drop for TieredCache<R> {
    fn drop(&mut self) {
        if let Some(probe) = self.probe.lock().take() {
            probe.stop();
        }
    }
}
