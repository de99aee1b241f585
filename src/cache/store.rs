//! Cache Store Module
//!
//! The cache engine: a concurrent entry table with expiration, size
//! accounting, and priority-based compaction. The table is a lock-free
//! `DashMap`; the running size total is an atomic; a small commit lock
//! linearizes only the speculative size check plus table install, so reads
//! and removals never serialize behind writers.
//!
//! Expiration scans, capacity compaction, and eviction callbacks all run on
//! worker threads and never block `commit`, `try_get`, or `remove`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as TableEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::clock::Clock;
use super::entry::{CacheEntry, CachePriority, CacheValue, EvictionReason};
use super::scope;
use super::stats::{CacheStats, StatsSnapshot};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Bound on compare-and-retry attempts for the size counter; exhaustion is
/// treated as capacity exceeded so commits always make progress.
const SIZE_UPDATE_MAX_ATTEMPTS: usize = 100;

// == Cache Store ==
/// Handle to a cache engine. Cloning is cheap and shares the engine.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
pub(crate) struct StoreInner {
    entries: DashMap<String, Arc<CacheEntry>>,
    cache_size: AtomicI64,
    commit_lock: Mutex<()>,
    last_expiration_scan: AtomicI64,
    disposed: AtomicBool,
    config: CacheConfig,
    stats: CacheStats,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a new engine from `config`.
    ///
    /// # Errors
    /// `InvalidArgument` if the configuration fails validation.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let now_ms = config.clock.now().timestamp_millis();
        Ok(Self {
            inner: Arc::new(StoreInner {
                entries: DashMap::new(),
                cache_size: AtomicI64::new(0),
                commit_lock: Mutex::new(()),
                last_expiration_scan: AtomicI64::new(now_ms),
                disposed: AtomicBool::new(false),
                config,
                stats: CacheStats::new(),
            }),
        })
    }

    // == Create Entry ==
    /// Opens an uncommitted entry for `key` and pushes it onto the current
    /// thread's scope stack. The entry becomes visible to readers only once
    /// `close()` commits it.
    ///
    /// # Errors
    /// `Disposed` after shutdown; `InvalidArgument` for an invalid key.
    pub fn create_entry(&self, key: &str) -> Result<Arc<CacheEntry>> {
        self.inner.check_disposed()?;
        CacheEntry::validate_key(key)?;
        let entry = CacheEntry::new(key.to_string(), Arc::downgrade(&self.inner));
        let guard = scope::enter(Arc::clone(&entry));
        entry.set_scope(guard);
        Ok(entry)
    }

    // == Try Get ==
    /// Looks up `key`. An expired hit (unless merely pending replacement)
    /// is fully removed and reported as a miss. A valid hit refreshes the
    /// access stamp and propagates the entry's expiration policy into the
    /// innermost open entry on this thread, if any.
    ///
    /// # Errors
    /// `Disposed` after shutdown; `InvalidArgument` for an invalid key.
    pub fn try_get(&self, key: &str) -> Result<Option<CacheValue>> {
        self.inner.check_disposed()?;
        CacheEntry::validate_key(key)?;
        let inner = &self.inner;
        let now = inner.config.clock.now();

        let found = inner.entries.get(key).map(|slot| Arc::clone(slot.value()));
        let mut result = None;
        match found {
            Some(entry) => {
                if entry.is_expired(now) && entry.eviction_reason() != EvictionReason::Replaced {
                    inner.remove_entry(&entry);
                    inner.stats.record_miss();
                } else {
                    entry.set_last_accessed(now);
                    result = entry.value();
                    if let Some(parent) = scope::current() {
                        if !Arc::ptr_eq(&entry, &parent) {
                            entry.propagate_to_parent(&parent);
                        }
                    }
                    inner.stats.record_hit();
                }
            }
            None => inner.stats.record_miss(),
        }

        inner.schedule_scan();
        Ok(result)
    }

    // == Remove ==
    /// Removes `key` unconditionally. Returns whether an entry was present.
    ///
    /// # Errors
    /// `Disposed` after shutdown; `InvalidArgument` for an invalid key.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.inner.check_disposed()?;
        CacheEntry::validate_key(key)?;
        let inner = &self.inner;

        let removed = match inner.entries.remove(key) {
            Some((_, entry)) => {
                if inner.config.size_limit.is_some() {
                    inner
                        .cache_size
                        .fetch_sub(entry.size().unwrap_or(0), Ordering::AcqRel);
                }
                entry.mark_expired(EvictionReason::Removed);
                entry.invoke_eviction_callbacks();
                true
            }
            None => false,
        };

        inner.schedule_scan();
        Ok(removed)
    }

    // == Expiration Scan ==
    /// Synchronously removes every expired entry. Returns the number of
    /// entries removed. The engine also runs this opportunistically on a
    /// worker thread after commits, reads, and removals.
    pub fn remove_expired(&self) -> usize {
        self.inner.scan_for_expired()
    }

    // == Compaction ==
    /// Removes roughly `percentage` of the cache: by size when a size limit
    /// is configured, otherwise by entry count with every entry as unit
    /// cost. Expired entries go first, then priority buckets Low, Normal,
    /// High in least-recently-used order. `NeverRemove` entries are exempt.
    pub fn compact(&self, percentage: f64) {
        let inner = &self.inner;
        if inner.config.size_limit.is_some() {
            let current = inner.cache_size.load(Ordering::Acquire);
            let retained = (current as f64 * (1.0 - percentage)).floor() as i64;
            let target = current - retained;
            if target > 0 {
                inner.compact_by(target, |entry| entry.size().unwrap_or(0));
            }
        } else {
            let target = (inner.entries.len() as f64 * percentage) as i64;
            if target > 0 {
                inner.compact_by(target, |_| 1);
            }
        }
    }

    // == Dispose ==
    /// Shuts the engine down. Every later `create_entry`/`try_get`/`remove`
    /// fails with `Disposed` and pending commits become no-ops.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }

    // == Diagnostics ==
    /// Current number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Current running size total.
    pub fn current_size(&self) -> i64 {
        self.inner.cache_size.load(Ordering::Acquire)
    }

    /// The engine's clock; consumers deriving deadlines must use it so a
    /// substituted clock governs every expiration decision.
    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.config.clock
    }

    /// Returns current cache statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.inner.stats.snapshot();
        snapshot.total_entries = self.len();
        snapshot.current_size = self.current_size();
        snapshot
    }
}

impl StoreInner {
    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CacheError::Disposed);
        }
        Ok(())
    }

    // == Commit ==
    /// Installs a closed entry into the table. Invoked by `close()`; a
    /// no-op once the engine is disposed.
    pub(crate) fn commit(self: &Arc<Self>, entry: &Arc<CacheEntry>) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let now = self.config.clock.now();

        if self.config.size_limit.is_some() && entry.size().is_none() {
            warn!(
                key = entry.key(),
                "discarding entry committed without a size while a size limit is configured"
            );
            entry.mark_expired(EvictionReason::Capacity);
            entry.invoke_eviction_callbacks();
            return;
        }

        entry.resolve_absolute_expiration(now);
        entry.set_last_accessed(now);

        let guard = self.commit_lock.lock();
        let old = self
            .entries
            .get(entry.key())
            .map(|slot| Arc::clone(slot.value()));
        if let Some(old_entry) = &old {
            // Superseded, but readers already holding it keep reading until
            // it leaves the table below.
            old_entry.mark_expired(EvictionReason::Replaced);
        }

        let expired = entry.is_expired(now);
        let exceeds_capacity = !expired && self.update_size_exceeds_capacity(entry);

        if !expired && !exceeds_capacity {
            let installed = match &old {
                None => self.try_add(entry),
                Some(old_entry) => {
                    if self.try_update(old_entry, entry) {
                        if self.config.size_limit.is_some() {
                            self.cache_size
                                .fetch_sub(old_entry.size().unwrap_or(0), Ordering::AcqRel);
                        }
                        true
                    } else {
                        // Lost the race against a concurrent removal; the
                        // slot is free again.
                        self.try_add(entry)
                    }
                }
            };
            drop(guard);

            if installed {
                entry.attach_tokens();
            } else {
                if self.config.size_limit.is_some() {
                    self.cache_size
                        .fetch_sub(entry.size().unwrap_or(0), Ordering::AcqRel);
                }
                entry.mark_expired(EvictionReason::Replaced);
                entry.invoke_eviction_callbacks();
            }
            if let Some(old_entry) = old {
                old_entry.invoke_eviction_callbacks();
            }
        } else {
            drop(guard);
            if exceeds_capacity {
                entry.mark_expired(EvictionReason::Capacity);
                self.trigger_compaction();
            }
            entry.invoke_eviction_callbacks();
            if let Some(old_entry) = &old {
                self.remove_entry(old_entry);
            }
        }

        self.schedule_scan();
    }

    /// Notification hook for token-fired expiration; runs on a worker
    /// thread, never on the token's firing thread.
    pub(crate) fn notify_expired(self: &Arc<Self>, entry: &Arc<CacheEntry>) {
        self.remove_entry(entry);
        self.schedule_scan();
    }

    // == Table Primitives ==
    fn try_add(&self, entry: &Arc<CacheEntry>) -> bool {
        match self.entries.entry(entry.key().to_string()) {
            TableEntry::Occupied(_) => false,
            TableEntry::Vacant(slot) => {
                slot.insert(Arc::clone(entry));
                true
            }
        }
    }

    fn try_update(&self, old: &Arc<CacheEntry>, new: &Arc<CacheEntry>) -> bool {
        match self.entries.get_mut(new.key()) {
            Some(mut slot) => {
                if Arc::ptr_eq(slot.value(), old) {
                    *slot = Arc::clone(new);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Removes `entry` only if it still occupies its slot, adjusting the
    /// size total and firing its callbacks. Identity comparison keeps a
    /// replaced predecessor from deducting the successor's size.
    fn remove_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        let removed = self
            .entries
            .remove_if(entry.key(), |_, current| Arc::ptr_eq(current, entry));
        if removed.is_none() {
            return false;
        }
        if self.config.size_limit.is_some() {
            self.cache_size
                .fetch_sub(entry.size().unwrap_or(0), Ordering::AcqRel);
        }
        self.stats.record_eviction();
        entry.invoke_eviction_callbacks();
        true
    }

    // == Size Accounting ==
    /// Speculatively adds the entry's size to the running total. Returns
    /// true (without mutating the total) when the addition would go
    /// negative, breach the limit, or exhaust its retry budget.
    fn update_size_exceeds_capacity(&self, entry: &Arc<CacheEntry>) -> bool {
        let Some(limit) = self.config.size_limit else {
            return false;
        };
        let entry_size = entry.size().unwrap_or(0);
        for _ in 0..SIZE_UPDATE_MAX_ATTEMPTS {
            let current = self.cache_size.load(Ordering::Acquire);
            let candidate = current + entry_size;
            if candidate < 0 || candidate > limit {
                return true;
            }
            if self
                .cache_size
                .compare_exchange(current, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return false;
            }
        }
        true
    }

    // == Expiration Scan ==
    /// Schedules a background scan if the configured frequency has elapsed
    /// since the last one.
    fn schedule_scan(self: &Arc<Self>) {
        let now_ms = self.config.clock.now().timestamp_millis();
        let frequency_ms = self.config.expiration_scan_frequency.num_milliseconds();
        let last = self.last_expiration_scan.load(Ordering::Acquire);
        if now_ms - last < frequency_ms {
            return;
        }
        if self
            .last_expiration_scan
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let store = Arc::clone(self);
            std::thread::spawn(move || {
                store.scan_for_expired();
            });
        }
    }

    fn scan_for_expired(&self) -> usize {
        let now = self.config.clock.now();
        let snapshot: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect();

        let mut removed = 0;
        for entry in snapshot {
            if entry.is_expired(now) && self.remove_entry(&entry) {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expiration scan removed entries");
        }
        removed
    }

    // == Compaction ==
    fn trigger_compaction(self: &Arc<Self>) {
        let store = Arc::clone(self);
        std::thread::spawn(move || {
            store.overcapacity_compaction();
        });
    }

    fn overcapacity_compaction(&self) {
        let current = self.cache_size.load(Ordering::Acquire);
        let retained = (current as f64 * (1.0 - self.config.compaction_percentage)).floor() as i64;
        let target = current - retained;
        if target <= 0 {
            return;
        }
        debug!(current, target, "running overcapacity compaction");
        self.compact_by(target, |entry| entry.size().unwrap_or(0));
    }

    /// Removes entries worth at least `target` cost. Policy order:
    /// expired entries first, then priority buckets Low, Normal, High;
    /// within a bucket, least recently used first. `NeverRemove` entries
    /// are never candidates. Reasons are stamped during selection; actual
    /// removal happens after the whole pass.
    fn compact_by<F>(&self, target: i64, size_of: F)
    where
        F: Fn(&Arc<CacheEntry>) -> i64,
    {
        let now = self.config.clock.now();
        let mut to_remove: Vec<Arc<CacheEntry>> = Vec::new();
        let mut low: Vec<Arc<CacheEntry>> = Vec::new();
        let mut normal: Vec<Arc<CacheEntry>> = Vec::new();
        let mut high: Vec<Arc<CacheEntry>> = Vec::new();
        let mut removed_size: i64 = 0;

        let snapshot: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect();
        for entry in snapshot {
            if entry.is_expired(now) {
                removed_size += size_of(&entry);
                to_remove.push(entry);
            } else {
                match entry.priority() {
                    CachePriority::Low => low.push(entry),
                    CachePriority::Normal => normal.push(entry),
                    CachePriority::High => high.push(entry),
                    CachePriority::NeverRemove => {}
                }
            }
        }

        for bucket in [low, normal, high] {
            Self::expire_priority_bucket(
                &mut removed_size,
                target,
                &size_of,
                &mut to_remove,
                bucket,
            );
        }

        for entry in &to_remove {
            self.remove_entry(entry);
        }
    }

    fn expire_priority_bucket<F>(
        removed_size: &mut i64,
        target: i64,
        size_of: &F,
        to_remove: &mut Vec<Arc<CacheEntry>>,
        mut bucket: Vec<Arc<CacheEntry>>,
    ) where
        F: Fn(&Arc<CacheEntry>) -> i64,
    {
        if target <= *removed_size {
            return;
        }
        bucket.sort_by_key(|entry| entry.last_accessed());
        for entry in bucket {
            entry.mark_expired(EvictionReason::Capacity);
            *removed_size += size_of(&entry);
            to_remove.push(entry);
            if target <= *removed_size {
                break;
            }
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ChangeToken, Clock, ManualClock};
    use chrono::{TimeDelta, Utc};
    use std::sync::mpsc;
    use std::time::Duration;

    fn store() -> CacheStore {
        CacheStore::new(CacheConfig::default()).unwrap()
    }

    fn store_with_clock(clock: Arc<ManualClock>) -> CacheStore {
        CacheStore::new(CacheConfig::default().with_clock(clock)).unwrap()
    }

    fn commit_string(store: &CacheStore, key: &str, value: &str) {
        let entry = store.create_entry(key).unwrap();
        entry.set_value(Arc::new(value.to_string()));
        entry.close();
    }

    fn get_string(store: &CacheStore, key: &str) -> Option<String> {
        store
            .try_get(key)
            .unwrap()
            .and_then(|value| value.downcast::<String>().ok())
            .map(|value| (*value).clone())
    }

    /// Background removal paths run on worker threads; poll briefly.
    fn wait_for_len(store: &CacheStore, expected: usize) {
        for _ in 0..100 {
            if store.len() == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(store.len(), expected);
    }

    #[test]
    fn test_commit_and_get() {
        let store = store();
        commit_string(&store, "key1", "value1");

        assert_eq!(get_string(&store, "key1"), Some("value1".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = store();
        assert!(store.try_get("missing").unwrap().is_none());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let store = store();
        assert!(matches!(
            store.create_entry(""),
            Err(CacheError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.try_get(""),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_then_reuse_key() {
        let store = store();
        commit_string(&store, "key1", "value1");

        assert!(store.remove("key1").unwrap());
        assert!(store.try_get("key1").unwrap().is_none());
        assert!(!store.remove("key1").unwrap());

        commit_string(&store, "key1", "value2");
        assert_eq!(get_string(&store, "key1"), Some("value2".to_string()));
    }

    #[test]
    fn test_remove_fires_callback_with_reason() {
        let store = store();
        let entry = store.create_entry("key1").unwrap();
        let (tx, rx) = mpsc::channel();
        entry.register_eviction_callback(
            move |key, _value, reason, _state| {
                tx.send((key, reason)).unwrap();
            },
            None,
        );
        entry.set_value(Arc::new("value".to_string()));
        entry.close();

        store.remove("key1").unwrap();
        let (key, reason) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(key, "key1");
        assert_eq!(reason, EvictionReason::Removed);
    }

    #[test]
    fn test_replace_marks_old_entry_and_fires_callbacks() {
        let store = store();
        let first = store.create_entry("key1").unwrap();
        let (tx, rx) = mpsc::channel();
        first.register_eviction_callback(
            move |_key, _value, reason, _state| {
                tx.send(reason).unwrap();
            },
            None,
        );
        first.set_value(Arc::new("old".to_string()));
        first.close();

        commit_string(&store, "key1", "new");

        assert_eq!(get_string(&store, "key1"), Some("new".to_string()));
        assert_eq!(store.len(), 1);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            EvictionReason::Replaced
        );
    }

    #[test]
    fn test_size_limit_requires_entry_size() {
        let store = CacheStore::new(CacheConfig::default().with_size_limit(100)).unwrap();
        let entry = store.create_entry("key1").unwrap();
        entry.set_value(Arc::new("value".to_string()));
        entry.close();

        assert_eq!(store.len(), 0);
        assert_eq!(store.current_size(), 0);
        assert!(store.try_get("key1").unwrap().is_none());
    }

    #[test]
    fn test_size_accounting_on_replace() {
        let store = CacheStore::new(CacheConfig::default().with_size_limit(10)).unwrap();

        let first = store.create_entry("key1").unwrap();
        first.set_size(4).unwrap();
        first.set_value(Arc::new("a".to_string()));
        first.close();
        assert_eq!(store.current_size(), 4);

        let second = store.create_entry("key1").unwrap();
        second.set_size(6).unwrap();
        second.set_value(Arc::new("b".to_string()));
        second.close();

        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size(), 6);
    }

    #[test]
    fn test_over_capacity_entry_discarded() {
        let store = CacheStore::new(CacheConfig::default().with_size_limit(10)).unwrap();
        let entry = store.create_entry("big").unwrap();
        let (tx, rx) = mpsc::channel();
        entry.register_eviction_callback(
            move |_key, _value, reason, _state| {
                tx.send(reason).unwrap();
            },
            None,
        );
        entry.set_size(11).unwrap();
        entry.set_value(Arc::new("value".to_string()));
        entry.close();

        assert_eq!(store.len(), 0);
        assert_eq!(store.current_size(), 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            EvictionReason::Capacity
        );
    }

    #[test]
    fn test_capacity_race_single_survivor_exact_size() {
        // Both sizes fit transiently; the replace protocol must subtract the
        // loser so the total never double-counts.
        let store = CacheStore::new(CacheConfig::default().with_size_limit(15)).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let entry = store.create_entry("key").unwrap();
                    entry.set_size(6).unwrap();
                    entry.set_value(Arc::new(format!("value{}", i)));
                    entry.close();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 1);
        assert_eq!(store.current_size(), 6);
        assert!(store.try_get("key").unwrap().is_some());
    }

    #[test]
    fn test_over_capacity_replacement_also_removes_old_entry() {
        let store = CacheStore::new(CacheConfig::default().with_size_limit(10)).unwrap();

        let first = store.create_entry("key1").unwrap();
        first.set_size(6).unwrap();
        first.set_value(Arc::new("a".to_string()));
        first.close();
        assert_eq!(store.current_size(), 6);

        // The replacement cannot fit alongside the old entry; both go.
        let second = store.create_entry("key1").unwrap();
        second.set_size(6).unwrap();
        second.set_value(Arc::new("b".to_string()));
        second.close();

        assert_eq!(store.len(), 0);
        assert_eq!(store.current_size(), 0);
        assert_eq!(second.eviction_reason(), EvictionReason::Capacity);
    }

    #[test]
    fn test_expired_at_commit_is_discarded() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());

        let entry = store.create_entry("key1").unwrap();
        let (tx, rx) = mpsc::channel();
        entry.register_eviction_callback(
            move |_key, _value, reason, _state| {
                tx.send(reason).unwrap();
            },
            None,
        );
        entry.set_absolute_expiration(clock.now() - TimeDelta::seconds(1));
        entry.set_value(Arc::new("value".to_string()));
        entry.close();

        assert_eq!(store.len(), 0);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            EvictionReason::Expired
        );
    }

    #[test]
    fn test_absolute_expiration_removes_on_get() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());

        let entry = store.create_entry("key1").unwrap();
        entry
            .set_absolute_expiration_relative_to_now(TimeDelta::seconds(10))
            .unwrap();
        entry.set_value(Arc::new("value".to_string()));
        entry.close();

        assert!(store.try_get("key1").unwrap().is_some());
        clock.advance(TimeDelta::seconds(11));
        assert!(store.try_get("key1").unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_sliding_expiration_refreshed_by_access() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());

        let entry = store.create_entry("key1").unwrap();
        entry.set_sliding_expiration(TimeDelta::seconds(5)).unwrap();
        entry.set_value(Arc::new("value".to_string()));
        entry.close();

        clock.advance(TimeDelta::seconds(4));
        assert!(store.try_get("key1").unwrap().is_some());

        // Access refreshed the window; four more seconds stays alive.
        clock.advance(TimeDelta::seconds(4));
        assert!(store.try_get("key1").unwrap().is_some());

        clock.advance(TimeDelta::seconds(6));
        assert!(store.try_get("key1").unwrap().is_none());
    }

    #[test]
    fn test_remove_expired_scan() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());

        for key in ["a", "b"] {
            let entry = store.create_entry(key).unwrap();
            entry
                .set_absolute_expiration_relative_to_now(TimeDelta::seconds(5))
                .unwrap();
            entry.set_value(Arc::new("value".to_string()));
            entry.close();
        }
        commit_string(&store, "keeper", "value");

        clock.advance(TimeDelta::seconds(10));
        assert_eq!(store.remove_expired(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.try_get("keeper").unwrap().is_some());
    }

    #[test]
    fn test_compaction_prefers_low_priority_lru() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());

        let t0 = clock.now();
        let make = |key: &str, priority: CachePriority, accessed| {
            let entry = store.create_entry(key).unwrap();
            entry.set_priority(priority);
            entry.set_value(Arc::new("value".to_string()));
            entry.close();
            entry.set_last_accessed(accessed);
        };
        make("a", CachePriority::Low, t0);
        make("b", CachePriority::Low, t0 + TimeDelta::seconds(10));
        make("c", CachePriority::High, t0);

        // Target of one unit: only the least-recently-used Low entry goes.
        store.compact(0.34);

        wait_for_len(&store, 2);
        assert!(store.try_get("a").unwrap().is_none());
        assert!(store.try_get("b").unwrap().is_some());
        assert!(store.try_get("c").unwrap().is_some());
    }

    #[test]
    fn test_compaction_removes_expired_first() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());

        let doomed = store.create_entry("doomed").unwrap();
        doomed
            .set_absolute_expiration_relative_to_now(TimeDelta::seconds(1))
            .unwrap();
        doomed.set_value(Arc::new("value".to_string()));
        doomed.close();

        let low = store.create_entry("low").unwrap();
        low.set_priority(CachePriority::Low);
        low.set_value(Arc::new("value".to_string()));
        low.close();

        clock.advance(TimeDelta::seconds(2));
        store.compact(0.5);

        wait_for_len(&store, 1);
        assert!(store.try_get("low").unwrap().is_some());
    }

    #[test]
    fn test_compaction_never_removes_never_remove() {
        let store = store();
        let pinned = store.create_entry("pinned").unwrap();
        pinned.set_priority(CachePriority::NeverRemove);
        pinned.set_value(Arc::new("value".to_string()));
        pinned.close();
        commit_string(&store, "expendable", "value");

        store.compact(1.0);

        wait_for_len(&store, 1);
        assert!(store.try_get("pinned").unwrap().is_some());
    }

    #[test]
    fn test_fired_token_evicts_entry() {
        let store = store();
        let token = ChangeToken::new();

        let entry = store.create_entry("key1").unwrap();
        let (tx, rx) = mpsc::channel();
        entry.register_eviction_callback(
            move |_key, _value, reason, _state| {
                tx.send(reason).unwrap();
            },
            None,
        );
        entry.add_expiration_token(token.clone());
        entry.set_value(Arc::new("value".to_string()));
        entry.close();
        assert_eq!(store.len(), 1);

        token.fire();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            EvictionReason::TokenExpired
        );
        wait_for_len(&store, 0);
    }

    #[test]
    fn test_nested_commit_propagates_to_outer_entry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());
        let now = clock.now();

        let outer = store.create_entry("outer").unwrap();
        assert!(outer.absolute_expiration().is_none());

        let inner = store.create_entry("inner").unwrap();
        inner
            .set_absolute_expiration(now + TimeDelta::seconds(10));
        inner.set_value(Arc::new("inner".to_string()));
        inner.close();

        assert_eq!(
            outer.absolute_expiration(),
            Some(now + TimeDelta::seconds(10))
        );

        outer.set_value(Arc::new("outer".to_string()));
        outer.close();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_cached_read_propagates_into_open_entry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = store_with_clock(clock.clone());
        let now = clock.now();

        let inner = store.create_entry("inner").unwrap();
        inner.set_absolute_expiration(now + TimeDelta::seconds(10));
        inner.set_value(Arc::new("inner".to_string()));
        inner.close();

        let outer = store.create_entry("outer").unwrap();
        assert!(store.try_get("inner").unwrap().is_some());
        assert_eq!(
            outer.absolute_expiration(),
            Some(now + TimeDelta::seconds(10))
        );
        outer.set_value(Arc::new("outer".to_string()));
        outer.close();
    }

    #[test]
    fn test_unclosed_entry_on_exiting_thread_is_discarded() {
        let store = store();
        let worker = store.clone();
        std::thread::spawn(move || {
            let _entry = worker.create_entry("abandoned").unwrap();
            // Thread exits without closing the entry.
        })
        .join()
        .unwrap();

        assert_eq!(store.len(), 0);
        assert!(store.try_get("abandoned").unwrap().is_none());
    }

    #[test]
    fn test_close_on_other_thread_keeps_stacks_independent() {
        let store = store();
        let entry = store.create_entry("key1").unwrap();
        entry.set_value(Arc::new("value".to_string()));

        std::thread::spawn(move || {
            entry.close();
            // The closing thread's own stack must stay empty.
            assert!(scope::current().is_none());
        })
        .join()
        .unwrap();

        assert_eq!(store.len(), 1);
        // The creating thread no longer sees the closed entry as open.
        assert!(scope::current().is_none());
        assert!(store.try_get("key1").unwrap().is_some());
    }

    #[test]
    fn test_dispose_rejects_operations() {
        let store = store();
        let pending = store.create_entry("pending").unwrap();
        pending.set_value(Arc::new("value".to_string()));

        store.dispose();

        assert!(matches!(store.create_entry("k"), Err(CacheError::Disposed)));
        assert!(matches!(store.try_get("k"), Err(CacheError::Disposed)));
        assert!(matches!(store.remove("k"), Err(CacheError::Disposed)));

        // A commit racing shutdown is silently dropped.
        pending.close();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_stats_track_hits_and_misses() {
        let store = store();
        commit_string(&store, "key1", "value1");

        assert!(store.try_get("key1").unwrap().is_some());
        assert!(store.try_get("nope").unwrap().is_none());

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_entries, 1);
    }
}
