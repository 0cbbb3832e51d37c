//! # Local TTL Cache
//!
//! Provide the in-process fallback cache: a concurrent map of key to value
//! plus expiry, with a background sweeper that evicts expired and cold
//! near-expiry entries.
//!
//! ## Usage
//!
//! - Use `LocalCache::new()` for the defaults (auto sweep every 60s, `ClearAll`).
//! - Use `LocalCache::with_config` to tune the sweeper or enable JSON mode.
//! - Use `sweep(policy)` to run one pass on demand; `purge` takes an explicit clock.
//!
//! ## Design Principles
//!
//! 1. **Sharded Map**: `DashMap` keeps locking per shard, so readers of
//!    different keys do not contend.
//! 2. **Single Counter**: The entry count is one `AtomicUsize` updated on
//!    insert/remove, never recomputed by scanning.
//! 3. **Lazy Expiry**: `get` treats a past-deadline entry as absent and drops it.
//! 4. **Bounded Sweeps**: `sweep_capacity` caps how many entries one pass evicts.
//!
//! ## Structure Overview
//!
//! ```text
//! LocalCache
//!   ├── inner: Arc<CacheInner>
//!   │     ├── map: DashMap<String, Entry>
//!   │     │     └── Entry { payload, ttl, expires_at, last_access }
//!   │     ├── count: AtomicUsize
//!   │     └── config: LocalCacheConfig
//!   └── sweeper: Mutex<Option<TaskHandle>>
//! ```

use std::any::{Any, type_name};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use tkv_common::{PeriodicTask, TaskHandle, TkvError, TkvResult, Ttl};

use crate::config::{LocalCacheConfig, SweepPolicy};

/// Stored form of a cached value.
enum Payload {
    // The value itself, shared so reads clone only what the caller asks for.
    Value(Arc<dyn Any + Send + Sync>),
    // Serialized JSON text (serialize-on-write mode).
    Json(String),
}

/// Internal record for a single cache entry.
struct Entry {
    payload: Payload,
    ttl: Ttl,
    // Absolute expiration; `None` for entries that never expire.
    expires_at: Option<Instant>,
    // Updated on every read; only the near-expiry shedding consults it.
    last_access: Instant,
}

impl Entry {
    fn new(payload: Payload, ttl: Ttl, now: Instant) -> Self {
        Entry {
            payload,
            ttl,
            expires_at: ttl.deadline_from(now),
            last_access: now,
        }
    }

    /// Replaces the value and restarts the TTL clock.
    fn reset(&mut self, payload: Payload, ttl: Ttl, now: Instant) {
        self.payload = payload;
        self.retime(ttl, now);
    }

    /// Restarts the TTL clock with a new TTL.
    fn retime(&mut self, ttl: Ttl, now: Instant) {
        self.ttl = ttl;
        self.expires_at = ttl.deadline_from(now);
        self.last_access = now;
    }

    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Entries removed because their deadline had passed.
    pub expired: usize,
    /// Entries removed early by near-expiry shedding.
    pub shed: usize,
}

impl SweepReport {
    /// Total entries removed.
    pub fn total(&self) -> usize {
        self.expired + self.shed
    }
}

struct CacheInner {
    map: DashMap<String, Entry>,
    count: AtomicUsize,
    config: LocalCacheConfig,
}

/// Concurrent in-process TTL cache.
pub struct LocalCache {
    inner: Arc<CacheInner>,
    sweeper: Mutex<Option<TaskHandle>>,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCache {
    /// Creates a cache with the default configuration (auto sweep enabled).
    pub fn new() -> Self {
        Self::with_config(LocalCacheConfig::default())
    }

    /// Creates a cache with a custom configuration.
    ///
    /// When `auto_sweep` is set, the sweeper thread starts immediately.
    pub fn with_config(config: LocalCacheConfig) -> Self {
        let config = config.normalized();
        let auto_sweep = config.auto_sweep;
        let cache = LocalCache {
            inner: Arc::new(CacheInner {
                map: DashMap::new(),
                count: AtomicUsize::new(0),
                config,
            }),
            sweeper: Mutex::new(None),
        };
        if auto_sweep {
            cache.start_sweeper();
        }
        cache
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &LocalCacheConfig {
        &self.inner.config
    }

    /// Starts the background sweeper if it is not already running.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let policy = inner.config.policy;
        *sweeper = Some(PeriodicTask::spawn(
            "tkv-cache-sweep",
            self.inner.config.sweep_interval(),
            move || {
                inner.purge(policy, Instant::now());
            },
        ));
    }

    /// Stops the background sweeper and waits for it to exit.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
        }
    }

    /// Returns true while the background sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|handle| handle.is_running())
            .unwrap_or(false)
    }

    /// Inserts or replaces a value. `ttl_secs <= 0` never expires.
    ///
    /// With `replace == false` an existing entry is left untouched and `false`
    /// is returned, which lets callers use the cache for lock contention.
    pub fn set<T>(&self, key: impl Into<String>, value: T, ttl_secs: i64, replace: bool) -> TkvResult<bool>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let ttl = Ttl::from_secs(ttl_secs);
        let payload = self.inner.encode(value)?;
        let now = Instant::now();

        // The entry API is the compare-and-insert: a concurrent insert that wins
        // first leaves us on the occupied (update) branch.
        match self.inner.map.entry(key.into()) {
            MapEntry::Occupied(mut occupied) => {
                if replace {
                    occupied.get_mut().reset(payload, ttl, now);
                }
                Ok(replace)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(payload, ttl, now));
                self.inner.count.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
        }
    }

    /// Replaces the value of an existing entry, keeping its TTL.
    ///
    /// The TTL clock restarts from now. Returns false when the key is missing.
    pub fn update<T>(&self, key: &str, value: T) -> TkvResult<bool>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let payload = self.inner.encode(value)?;
        let now = Instant::now();
        match self.inner.map.get_mut(key) {
            Some(mut entry) => {
                let ttl = entry.ttl;
                entry.reset(payload, ttl, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Looks up a value and marks the entry as recently accessed.
    ///
    /// Missing and expired keys return `Ok(None)`. A stored value of a
    /// different type than `T` returns `TkvError::Conversion`.
    pub fn get<T>(&self, key: &str) -> TkvResult<Option<T>>
    where
        T: DeserializeOwned + Clone + 'static,
    {
        let now = Instant::now();
        match self.inner.map.get_mut(key) {
            None => return Ok(None),
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                return decode::<T>(&entry.payload).map(Some);
            }
            // Drop the shard guard before removing.
            Some(_) => {}
        }

        self.inner.remove_expired(key, now);
        Ok(None)
    }

    /// Removes keys and returns how many were present.
    pub fn remove<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut removed = 0;
        for key in keys {
            if self.inner.map.remove(key.as_ref()).is_some() {
                self.inner.count.fetch_sub(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        removed
    }

    /// Sets a new TTL on an existing key, restarting its clock.
    ///
    /// Returns false when the key is missing.
    pub fn set_ttl(&self, key: &str, ttl_secs: i64) -> bool {
        let ttl = Ttl::from_secs(ttl_secs);
        match self.inner.map.get_mut(key) {
            Some(mut entry) => {
                entry.retime(ttl, Instant::now());
                true
            }
            None => false,
        }
    }

    /// Returns the remaining TTL in whole seconds (rounded up).
    ///
    /// `-1` means the entry never expires; `0` means missing or expired.
    pub fn get_ttl(&self, key: &str) -> i64 {
        let now = Instant::now();
        let entry = match self.inner.map.get(key) {
            Some(entry) => entry,
            None => return 0,
        };
        match entry.expires_at {
            None => -1,
            Some(deadline) if deadline <= now => 0,
            Some(deadline) => {
                let remaining = deadline - now;
                let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
                secs as i64
            }
        }
    }

    /// Returns true if the key is present (expired entries count until swept).
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.map.contains_key(key)
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.count.load(Ordering::Relaxed)
    }

    /// Returns true when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a snapshot of all keys. O(n); avoid on hot paths.
    pub fn keys(&self) -> Vec<String> {
        self.inner.map.iter().map(|item| item.key().clone()).collect()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.map.clear();
        self.inner.count.store(0, Ordering::Relaxed);
    }

    /// Runs one sweep with the given policy at `now`.
    pub fn purge(&self, policy: SweepPolicy, now: Instant) -> SweepReport {
        self.inner.purge(policy, now)
    }

    /// Runs one sweep with `policy` at the current time.
    pub fn sweep(&self, policy: SweepPolicy) -> SweepReport {
        self.inner.purge(policy, Instant::now())
    }
}

impl Drop for LocalCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl CacheInner {
    fn encode<T>(&self, value: T) -> TkvResult<Payload>
    where
        T: Serialize + Send + Sync + 'static,
    {
        if self.config.json_serialize {
            let text = serde_json::to_string(&value).map_err(|err| TkvError::Serialize(err.to_string()))?;
            Ok(Payload::Json(text))
        } else {
            Ok(Payload::Value(Arc::new(value)))
        }
    }

    fn remove_expired(&self, key: &str, now: Instant) -> bool {
        // Re-check under the shard lock; a writer may have refreshed the entry.
        if self.map.remove_if(key, |_, entry| entry.is_expired(now)).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Collects candidates first and removes afterwards, so no shard lock is
    /// held across the scan and the removals.
    fn purge(&self, policy: SweepPolicy, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        if self.map.is_empty() {
            return report;
        }

        let budget = self.config.sweep_budget();
        let shed_window = Duration::from_secs(self.config.shed_window_sec);
        let horizon = now.checked_add(shed_window).unwrap_or(now);
        let shed_min_ttl = self.config.shed_min_ttl_sec;

        let mut expired: Vec<String> = Vec::new();
        let mut shed: Vec<(Instant, String)> = Vec::new();

        for item in self.map.iter() {
            if expired.len() + shed.len() >= budget {
                break;
            }
            let entry = item.value();
            let deadline = match entry.expires_at {
                Some(deadline) => deadline,
                None => continue,
            };
            if deadline <= now {
                expired.push(item.key().clone());
                continue;
            }
            if policy == SweepPolicy::ClearAll && deadline < horizon {
                if let Ttl::Seconds(secs) = entry.ttl {
                    if secs > shed_min_ttl {
                        shed.push((entry.last_access, item.key().clone()));
                    }
                }
            }
        }

        for key in &expired {
            if self.remove_expired(key, now) {
                report.expired += 1;
            }
        }

        // Coldest first.
        shed.sort_by(|a, b| a.0.cmp(&b.0));
        for (seen_access, key) in &shed {
            let removed = self.map.remove_if(key.as_str(), |_, entry| {
                entry.last_access <= *seen_access
                    && entry.expires_at.map(|deadline| deadline < horizon).unwrap_or(false)
            });
            if removed.is_some() {
                self.count.fetch_sub(1, Ordering::Relaxed);
                report.shed += 1;
            }
        }

        if report.total() > 0 {
            tracing::debug!(
                expired = report.expired,
                shed = report.shed,
                remaining = self.count.load(Ordering::Relaxed),
                "local cache sweep finished"
            );
        }
        report
    }
}

fn decode<T>(payload: &Payload) -> TkvResult<T>
where
    T: DeserializeOwned + Clone + 'static,
{
    match payload {
        Payload::Json(text) => serde_json::from_str(text).map_err(|err| {
            TkvError::Conversion(format!("cannot read {} from cached json: {err}", type_name::<T>()))
        }),
        Payload::Value(value) => value.downcast_ref::<T>().cloned().ok_or_else(|| {
            TkvError::Conversion(format!("cached value is not a {}", type_name::<T>()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn manual_cache() -> LocalCache {
        LocalCache::with_config(LocalCacheConfig {
            auto_sweep: false,
            ..LocalCacheConfig::default()
        })
    }

    fn json_cache() -> LocalCache {
        LocalCache::with_config(LocalCacheConfig {
            auto_sweep: false,
            json_serialize: true,
            ..LocalCacheConfig::default()
        })
    }

    #[test]
    fn set_get_remove_scenario() {
        let cache = manual_cache();
        assert!(cache.set("name", "Mo".to_string(), -1, true).unwrap());
        assert_eq!(cache.get::<String>("name").unwrap(), Some("Mo".to_string()));
        assert_eq!(cache.remove(["name"]), 1);
        assert_eq!(cache.get::<String>("name").unwrap(), None);
        assert_eq!(cache.get::<String>("name").unwrap().unwrap_or_default(), "");
    }

    #[test]
    fn set_without_replace_keeps_existing() {
        let cache = manual_cache();
        assert!(cache.set("lock", 1u32, 30, false).unwrap());
        assert!(!cache.set("lock", 2u32, 30, false).unwrap());
        assert_eq!(cache.get::<u32>("lock").unwrap(), Some(1));
        assert!(cache.set("lock", 3u32, 30, true).unwrap());
        assert_eq!(cache.get::<u32>("lock").unwrap(), Some(3));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_keeps_ttl() {
        let cache = manual_cache();
        assert!(!cache.update("missing", 1i64).unwrap());
        cache.set("counter", 1i64, 120, true).unwrap();
        assert!(cache.update("counter", 2i64).unwrap());
        assert_eq!(cache.get::<i64>("counter").unwrap(), Some(2));
        let ttl = cache.get_ttl("counter");
        assert!(ttl > 118 && ttl <= 120, "ttl was {ttl}");
    }

    #[test]
    fn zero_ttl_never_expires() {
        let cache = manual_cache();
        cache.set("zero", 1i64, 0, true).unwrap();
        assert_eq!(cache.get_ttl("zero"), -1);
        assert_eq!(cache.sweep(SweepPolicy::ClearAll).total(), 0);
        assert_eq!(cache.get::<i64>("zero").unwrap(), Some(1));
    }

    #[test]
    fn ttl_accessors() {
        let cache = manual_cache();
        assert_eq!(cache.get_ttl("missing"), 0);
        cache.set("forever", "v".to_string(), -1, true).unwrap();
        assert_eq!(cache.get_ttl("forever"), -1);
        assert!(cache.set_ttl("forever", 10));
        let ttl = cache.get_ttl("forever");
        assert!(ttl > 8 && ttl <= 10, "ttl was {ttl}");
        assert!(!cache.set_ttl("missing", 10));
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = manual_cache();
        cache.set("short", "v".to_string(), 1, true).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(cache.get::<String>("short").unwrap(), None);
        assert_eq!(cache.get_ttl("short"), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn on_demand_sweep_removes_expired_and_keeps_forever() {
        let cache = manual_cache();
        cache.set("short", 1i64, 1, true).unwrap();
        cache.set("forever", 2i64, -1, true).unwrap();
        std::thread::sleep(Duration::from_millis(1100));

        let report = cache.sweep(SweepPolicy::ClearAll);
        assert_eq!(report.expired, 1);
        assert_eq!(report.shed, 0);
        assert!(!cache.contains_key("short"));
        assert_eq!(cache.get::<i64>("forever").unwrap(), Some(2));
    }

    #[test]
    fn type_mismatch_is_conversion_error() {
        let cache = manual_cache();
        cache.set("n", 7u8, -1, true).unwrap();
        assert!(matches!(cache.get::<String>("n"), Err(TkvError::Conversion(_))));
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    #[test]
    fn json_mode_roundtrips_structs() {
        let cache = json_cache();
        let profile = Profile { name: "Mo".into(), age: 30 };
        cache.set("profile", profile.clone(), -1, true).unwrap();
        assert_eq!(cache.get::<Profile>("profile").unwrap(), Some(profile));
        // JSON mode converts between compatible shapes.
        cache.set("num", 5u8, -1, true).unwrap();
        assert_eq!(cache.get::<u64>("num").unwrap(), Some(5));
    }

    #[test]
    fn clear_resets_count() {
        let cache = manual_cache();
        for idx in 0..10 {
            cache.set(format!("k{idx}"), idx, -1, true).unwrap();
        }
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.keys().len(), 10);
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains_key("k1"));
    }

    #[test]
    fn only_expired_policy_leaves_near_expiry() {
        let cache = manual_cache();
        cache.set("gone", 1, 1, true).unwrap();
        cache.set("long", 2, 4000, true).unwrap();
        cache.set("forever", 3, -1, true).unwrap();

        let later = Instant::now() + Duration::from_secs(2);
        let report = cache.purge(SweepPolicy::OnlyExpired, later);
        assert_eq!(report, SweepReport { expired: 1, shed: 0 });
        assert!(cache.contains_key("long"));
        assert!(cache.contains_key("forever"));
    }

    #[test]
    fn clear_all_sheds_long_ttl_entries_near_expiry() {
        let cache = manual_cache();
        cache.set("long", 1, 4000, true).unwrap();
        cache.set("short", 2, 600, true).unwrap();
        cache.set("forever", 3, -1, true).unwrap();

        // 1000s later "long" has 3000s left (inside the 1h window), "short" is past due.
        let later = Instant::now() + Duration::from_secs(1000);
        let report = cache.purge(SweepPolicy::ClearAll, later);
        assert_eq!(report, SweepReport { expired: 1, shed: 1 });
        assert!(cache.contains_key("forever"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn short_ttl_is_not_shed_early() {
        let cache = manual_cache();
        cache.set("short", 1, 600, true).unwrap();
        let report = cache.purge(SweepPolicy::ClearAll, Instant::now());
        assert_eq!(report.total(), 0);
        assert!(cache.contains_key("short"));
    }

    #[test]
    fn never_expiring_entries_survive_every_policy() {
        let cache = manual_cache();
        cache.set("pinned", 1, -1, true).unwrap();
        let far = Instant::now() + Duration::from_secs(365 * 24 * 3600);
        assert_eq!(cache.purge(SweepPolicy::ClearAll, far).total(), 0);
        assert_eq!(cache.purge(SweepPolicy::OnlyExpired, far).total(), 0);
        assert_eq!(cache.get::<i32>("pinned").unwrap(), Some(1));
    }

    #[test]
    fn sweep_capacity_bounds_one_pass() {
        let cache = LocalCache::with_config(LocalCacheConfig {
            auto_sweep: false,
            sweep_capacity: 3,
            ..LocalCacheConfig::default()
        });
        for idx in 0..10 {
            cache.set(format!("k{idx}"), idx, 1, true).unwrap();
        }
        let later = Instant::now() + Duration::from_secs(5);
        assert_eq!(cache.purge(SweepPolicy::OnlyExpired, later).expired, 3);
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn background_sweeper_evicts_expired() {
        let cache = LocalCache::with_config(LocalCacheConfig {
            auto_sweep: true,
            sweep_interval_sec: 1,
            ..LocalCacheConfig::default()
        });
        assert!(cache.is_sweeping());
        cache.set("k", 1, 1, true).unwrap();
        cache.set("pinned", 2, -1, true).unwrap();
        std::thread::sleep(Duration::from_millis(2300));
        assert!(!cache.contains_key("k"));
        assert!(cache.contains_key("pinned"));
        cache.stop_sweeper();
        assert!(!cache.is_sweeping());
    }

    #[test]
    fn concurrent_inserts_count_once_per_key() {
        let cache = Arc::new(manual_cache());
        let mut threads = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            threads.push(std::thread::spawn(move || {
                for idx in 0..100 {
                    cache.set(format!("k{idx}"), idx, -1, true).unwrap();
                }
            }));
        }
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(cache.len(), 100);
    }
}
