//! # Resource Pool
//!
//! Purpose: Reuse expensive resources (sockets, scratch buffers) across calls
//! without a global lock on the hot path.
//!
//! ## Design Principles
//! 1. **Three Tiers**: A single most-recent slot, a fixed array of active
//!    slots, and an overflow stack. Acquire searches them in that order and
//!    release fills them in that order, so warm resources are reused first.
//! 2. **CAS on Slots**: Slots hold resource ids in `AtomicUsize` (0 = empty);
//!    every transition is a single compare-and-swap, so callers touching
//!    different slots never block each other.
//! 3. **Left-Filled Active Array**: Release fills the first empty active slot
//!    and acquire empties the last occupied one, so an empty slot means every
//!    slot to its right is empty too. Scans stop at the first empty slot. A
//!    release racing an acquire can fill the slot right of the one being
//!    emptied; the acquire shifts that neighbour left. An id stranded right
//!    of a remaining hole stays parked and is reachable again once a later
//!    release refills the hole.
//! 4. **Busy Tracking**: Only ids recorded as lent out can be released; a
//!    sweep reclaims leases that outlive their TTL so leaks do not shrink
//!    capacity forever.
//! 5. **Injected Factory**: New resources come from a caller-supplied closure.
//!
//! ## Structure Overview
//!
//! ```text
//! Pool<T>
//!   ├── shared: Arc<Shared<T>>
//!   │     ├── recent: AtomicUsize            (tier 1)
//!   │     ├── active: [AtomicUsize]          (tier 2, left-filled)
//!   │     ├── overflow: Mutex<Vec<usize>>    (tier 3, stack)
//!   │     ├── parked: DashMap<id, Parked<T>> (idle resources by id)
//!   │     └── busy: DashMap<id, LeaseInfo>   (lent-out ids)
//!   └── sweeper: Mutex<Option<TaskHandle>>
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use tkv_common::{PeriodicTask, TaskHandle, TkvError, TkvResult};

const EMPTY: usize = 0;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// A resource that can live in a `Pool`.
pub trait Poolable: Send + Sync + 'static {
    /// Prepares an idle resource for its next borrower.
    fn reset(&mut self) {}

    /// Releases whatever the resource holds before it is discarded.
    fn destroy(&mut self) -> TkvResult<()> {
        Ok(())
    }
}

/// Builds a new resource when no idle one is available.
pub type Factory<T> = Box<dyn Fn() -> TkvResult<T> + Send + Sync>;

/// Pool sizing and reclamation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Idle resources the sweep never evicts.
    pub min_idle: usize,
    /// Ceiling on resources lent out at once; 0 means unbounded.
    pub max_count: usize,
    /// Size of the active-slot array.
    pub active_slots: usize,
    /// Default per-lease TTL; `None` leases are never reclaimed.
    pub lease_ttl: Option<Duration>,
    /// Background sweep period; `None` disables the sweeper.
    pub sweep_interval: Option<Duration>,
    /// Leases older than this are reclaimed even if their TTL is longer.
    pub max_lend: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_idle: 3,
            max_count: 0,
            active_slots: default_active_slots(),
            lease_ttl: Some(Duration::from_secs(10)),
            sweep_interval: Some(Duration::from_secs(30)),
            max_lend: Duration::from_secs(3600),
        }
    }
}

/// Twice the CPU count, at least 4.
pub fn default_active_slots() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    (cpus * 2).max(4)
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Resources currently lent out.
    pub busy: usize,
    /// Occupied most-recent + active slots.
    pub idle_slots: usize,
    /// Resources parked in the overflow stack.
    pub overflow: usize,
    /// Resources built by the factory so far.
    pub created: u64,
    /// Leases dropped from busy tracking by the sweep.
    pub reclaimed: u64,
    /// Idle resources destroyed by the sweep.
    pub evicted: u64,
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSweep {
    pub reclaimed: usize,
    pub evicted: usize,
}

struct Parked<T> {
    item: T,
    since: Instant,
    ttl: Option<Duration>,
}

impl<T> Parked<T> {
    fn is_stale(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.since) > ttl,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LeaseInfo {
    lent_at: Instant,
    ttl: Option<Duration>,
}

impl LeaseInfo {
    fn is_overdue(&self, now: Instant, max_lend: Duration) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let lent_for = now.saturating_duration_since(self.lent_at);
        lent_for > ttl || lent_for > max_lend
    }
}

/// A resource taken out of a pool, detached from any guard.
///
/// Hand it back with `Pool::release`.
pub struct Lease<T> {
    pool_id: usize,
    id: usize,
    ttl: Option<Duration>,
    item: T,
}

impl<T> Lease<T> {
    /// Identity of the resource within its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    pub fn item_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

struct Shared<T: Poolable> {
    pool_id: usize,
    name: String,
    config: PoolConfig,
    factory: Factory<T>,
    recent: AtomicUsize,
    active: Box<[AtomicUsize]>,
    overflow: Mutex<Vec<usize>>,
    parked: DashMap<usize, Parked<T>>,
    busy: DashMap<usize, LeaseInfo>,
    busy_count: AtomicUsize,
    next_id: AtomicUsize,
    created: AtomicU64,
    reclaimed: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicBool,
}

/// Lock-free three-tier resource pool.
pub struct Pool<T: Poolable> {
    shared: Arc<Shared<T>>,
    sweeper: Mutex<Option<TaskHandle>>,
}

impl<T: Poolable> Pool<T> {
    /// Creates a pool and starts its sweeper when `sweep_interval` is set.
    pub fn new<F>(name: &str, config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> TkvResult<T> + Send + Sync + 'static,
    {
        let slots = config.active_slots.max(1);
        let active = (0..slots).map(|_| AtomicUsize::new(EMPTY)).collect();
        let shared = Arc::new(Shared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            config,
            factory: Box::new(factory),
            recent: AtomicUsize::new(EMPTY),
            active,
            overflow: Mutex::new(Vec::new()),
            parked: DashMap::new(),
            busy: DashMap::new(),
            busy_count: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            created: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let sweeper = shared.config.sweep_interval.map(|interval| {
            let sweep_shared = Arc::clone(&shared);
            PeriodicTask::spawn(&format!("{name}-pool-sweep"), interval, move || {
                sweep_shared.sweep(Instant::now());
            })
        });

        Pool {
            shared,
            sweeper: Mutex::new(sweeper),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Takes a resource using the configured lease TTL.
    pub fn acquire(&self) -> TkvResult<Pooled<T>> {
        self.acquire_with_ttl(self.shared.config.lease_ttl)
    }

    /// Takes a resource with an explicit lease TTL (`None` = never reclaimed).
    ///
    /// Never blocks: fails with `PoolExhausted` when nothing is idle and the
    /// pool is at `max_count`.
    pub fn acquire_with_ttl(&self, ttl: Option<Duration>) -> TkvResult<Pooled<T>> {
        let lease = self.shared.acquire(ttl)?;
        Ok(Pooled {
            shared: Arc::clone(&self.shared),
            lease: Some(lease),
        })
    }

    /// Returns a detached lease. Foreign or reclaimed leases return false.
    pub fn release(&self, lease: Lease<T>) -> bool {
        self.shared.release(lease)
    }

    /// Runs one reclamation pass at `now`.
    pub fn sweep(&self, now: Instant) -> PoolSweep {
        self.shared.sweep(now)
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let idle_slots = std::iter::once(&shared.recent)
            .chain(shared.active.iter())
            .filter(|slot| slot.load(Ordering::Acquire) != EMPTY)
            .count();
        PoolStats {
            busy: shared.busy_count.load(Ordering::Acquire),
            idle_slots,
            overflow: shared.overflow.lock().len(),
            created: shared.created.load(Ordering::Relaxed),
            reclaimed: shared.reclaimed.load(Ordering::Relaxed),
            evicted: shared.evicted.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops the sweeper and destroys every idle resource.
    ///
    /// Resources still lent out are destroyed when they come back.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.stop();
        }
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let destroyed = self.shared.drain_parked();
        self.shared.busy.clear();
        self.shared.busy_count.store(0, Ordering::Release);
        tracing::info!(pool = %self.shared.name, destroyed, "pool closed");
    }

    #[cfg(test)]
    fn active_occupancy(&self) -> Vec<bool> {
        self.shared
            .active
            .iter()
            .map(|slot| slot.load(Ordering::Acquire) != EMPTY)
            .collect()
    }
}

impl<T: Poolable> Drop for Pool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Poolable> Shared<T> {
    fn acquire(&self, ttl: Option<Duration>) -> TkvResult<Lease<T>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TkvError::Closed);
        }

        let (id, item) = match self.take_parked() {
            Some(found) => {
                self.busy_count.fetch_add(1, Ordering::AcqRel);
                found
            }
            None => {
                self.reserve()?;
                match (self.factory)() {
                    Ok(item) => {
                        self.created.fetch_add(1, Ordering::Relaxed);
                        (self.next_id.fetch_add(1, Ordering::Relaxed), item)
                    }
                    Err(err) => {
                        self.busy_count.fetch_sub(1, Ordering::AcqRel);
                        return Err(match err {
                            TkvError::Create(_) => err,
                            other => TkvError::Create(other.to_string()),
                        });
                    }
                }
            }
        };

        self.busy.insert(
            id,
            LeaseInfo {
                lent_at: Instant::now(),
                ttl,
            },
        );
        Ok(Lease {
            pool_id: self.pool_id,
            id,
            ttl,
            item,
        })
    }

    /// Claims one busy unit against `max_count`.
    fn reserve(&self) -> TkvResult<()> {
        let max = self.config.max_count;
        let mut current = self.busy_count.load(Ordering::Acquire);
        loop {
            if max > 0 && current >= max {
                return Err(TkvError::PoolExhausted { max });
            }
            match self.busy_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn take_parked(&self) -> Option<(usize, T)> {
        let id = self.recent.swap(EMPTY, Ordering::AcqRel);
        if id != EMPTY {
            if let Some(item) = self.claim(id) {
                return Some((id, item));
            }
        }

        // Bounded retries: each CAS failure means another caller made progress.
        for _ in 0..self.active.len() * 2 {
            let mut last = None;
            for (idx, slot) in self.active.iter().enumerate() {
                let id = slot.load(Ordering::Acquire);
                if id == EMPTY {
                    break;
                }
                last = Some((idx, id));
            }
            let Some((idx, id)) = last else {
                break;
            };
            if self.active[idx]
                .compare_exchange(id, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.compact_after(idx);
                if let Some(item) = self.claim(id) {
                    return Some((id, item));
                }
            }
        }

        loop {
            let id = self.overflow.lock().pop()?;
            if let Some(item) = self.claim(id) {
                return Some((id, item));
            }
        }
    }

    /// Moves a neighbour published right of `idx` (between our scan and our
    /// CAS) into the slot just emptied.
    fn compact_after(&self, idx: usize) {
        let Some(next) = self.active.get(idx + 1) else {
            return;
        };
        let id = next.load(Ordering::Acquire);
        if id == EMPTY
            || next
                .compare_exchange(id, EMPTY, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        if self.active[idx]
            .compare_exchange(EMPTY, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.publish(id);
        }
    }

    fn claim(&self, id: usize) -> Option<T> {
        self.parked.remove(&id).map(|(_, parked)| parked.item)
    }

    fn release(&self, lease: Lease<T>) -> bool {
        let Lease {
            pool_id,
            id,
            ttl,
            mut item,
        } = lease;

        if pool_id != self.pool_id {
            return false;
        }
        if self.busy.remove(&id).is_none() {
            // Reclaimed by the sweep (or never lent): the pool no longer tracks it.
            self.destroy(&mut item);
            return false;
        }
        self.busy_count.fetch_sub(1, Ordering::AcqRel);

        if self.closed.load(Ordering::Acquire) {
            self.destroy(&mut item);
            return true;
        }

        item.reset();
        // Park before publishing so any id found in a slot is claimable.
        self.parked.insert(
            id,
            Parked {
                item,
                since: Instant::now(),
                ttl,
            },
        );
        self.publish(id);

        if self.closed.load(Ordering::Acquire) {
            self.drain_parked();
        }
        true
    }

    fn publish(&self, id: usize) {
        if self
            .recent
            .compare_exchange(EMPTY, id, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return;
        }
        for slot in self.active.iter() {
            if slot
                .compare_exchange(EMPTY, id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
        self.overflow.lock().push(id);
    }

    fn sweep(&self, now: Instant) -> PoolSweep {
        let mut result = PoolSweep::default();
        if self.closed.load(Ordering::Acquire) {
            return result;
        }

        let max_lend = self.config.max_lend;
        let overdue: Vec<usize> = self
            .busy
            .iter()
            .filter(|entry| entry.value().is_overdue(now, max_lend))
            .map(|entry| *entry.key())
            .collect();
        for id in overdue {
            // Not destroyed: the borrower may still be using it.
            if self
                .busy
                .remove_if(&id, |_, lease| lease.is_overdue(now, max_lend))
                .is_some()
            {
                self.busy_count.fetch_sub(1, Ordering::AcqRel);
                result.reclaimed += 1;
            }
        }

        let mut stale = Vec::new();
        {
            let mut overflow = self.overflow.lock();
            let mut idle = self.parked.len();
            // Oldest entries sit at the bottom of the stack.
            overflow.retain(|id| {
                if idle <= self.config.min_idle {
                    return true;
                }
                match self.parked.remove_if(id, |_, parked| parked.is_stale(now)) {
                    Some((_, parked)) => {
                        idle -= 1;
                        stale.push(parked.item);
                        false
                    }
                    None => true,
                }
            });
        }
        for mut item in stale {
            self.destroy(&mut item);
            result.evicted += 1;
        }

        self.reclaimed
            .fetch_add(result.reclaimed as u64, Ordering::Relaxed);
        self.evicted.fetch_add(result.evicted as u64, Ordering::Relaxed);
        if result.reclaimed > 0 {
            tracing::warn!(
                pool = %self.name,
                reclaimed = result.reclaimed,
                "reclaimed leases that were never returned"
            );
        }
        if result.evicted > 0 {
            tracing::debug!(pool = %self.name, evicted = result.evicted, "evicted idle resources");
        }
        result
    }

    fn drain_parked(&self) -> usize {
        self.recent.store(EMPTY, Ordering::Release);
        for slot in self.active.iter() {
            slot.store(EMPTY, Ordering::Release);
        }
        self.overflow.lock().clear();

        let ids: Vec<usize> = self.parked.iter().map(|entry| *entry.key()).collect();
        let mut destroyed = 0;
        for id in ids {
            if let Some((_, mut parked)) = self.parked.remove(&id) {
                self.destroy(&mut parked.item);
                destroyed += 1;
            }
        }
        destroyed
    }

    fn destroy(&self, item: &mut T) {
        if let Err(err) = item.destroy() {
            tracing::warn!(pool = %self.name, error = %err, "failed to destroy pooled resource");
        }
    }
}

/// RAII guard for a pooled resource; returns it to the pool on drop.
pub struct Pooled<T: Poolable> {
    shared: Arc<Shared<T>>,
    lease: Option<Lease<T>>,
}

impl<T: Poolable> Pooled<T> {
    pub fn id(&self) -> usize {
        self.lease_ref().id
    }

    /// Returns the resource now; false if the pool no longer tracked it.
    pub fn release(mut self) -> bool {
        match self.lease.take() {
            Some(lease) => self.shared.release(lease),
            None => false,
        }
    }

    /// Detaches the resource from the guard without returning it.
    pub fn into_lease(mut self) -> Lease<T> {
        match self.lease.take() {
            Some(lease) => lease,
            None => unreachable!("pooled guard without a lease"),
        }
    }

    fn lease_ref(&self) -> &Lease<T> {
        match &self.lease {
            Some(lease) => lease,
            None => unreachable!("pooled guard without a lease"),
        }
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lease_ref().item
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.lease {
            Some(lease) => &mut lease.item,
            None => unreachable!("pooled guard without a lease"),
        }
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.shared.release(lease);
        }
    }
}
