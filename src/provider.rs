//! Provider Module
//!
//! Typed facade over the cache engine: `get`/`set`/`remove` with downcast
//! checking, and `get_or_create` with per-key single-flight so a cold key
//! runs its factory exactly once. Entries created through the provider can
//! opt into immediate expiration, where a timer actively evicts the entry
//! instead of waiting for the next access to notice it is stale.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::entry::CacheEntry;
use crate::cache::{CachePriority, CacheStore, CacheValue, ChangeToken, Clock, StatsSnapshot};
use crate::error::{CacheError, Result};

// == Expiration Mode ==
/// How absolute expiration is enforced for entries created through the
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpirationMode {
    /// Expired entries linger until an access or scan notices them.
    #[default]
    Lazy,
    /// A timer fires at the deadline and evicts the entry immediately.
    /// Requires a running tokio runtime.
    Immediate,
}

// == Entry Options ==
/// Expiration and eviction policy applied to entries the provider creates.
#[derive(Debug, Clone, Default)]
pub struct EntryOptions {
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub absolute_expiration_relative_to_now: Option<TimeDelta>,
    pub sliding_expiration: Option<TimeDelta>,
    pub priority: CachePriority,
    pub size: Option<i64>,
    pub expiration_mode: ExpirationMode,
}

impl EntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_absolute_expiration(mut self, instant: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(instant);
        self
    }

    pub fn with_absolute_expiration_relative_to_now(mut self, delta: TimeDelta) -> Self {
        self.absolute_expiration_relative_to_now = Some(delta);
        self
    }

    pub fn with_sliding_expiration(mut self, delta: TimeDelta) -> Self {
        self.sliding_expiration = Some(delta);
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    /// Shorthand for a relative deadline enforced by an eviction timer.
    pub fn immediate_absolute_expiration(mut self, delta: TimeDelta) -> Self {
        self.absolute_expiration_relative_to_now = Some(delta);
        self.expiration_mode = ExpirationMode::Immediate;
        self
    }
}

// == Cache Provider ==
/// Typed cache facade. Values are stored as `Arc<T>` and shared between
/// the cache and callers.
#[derive(Debug)]
pub struct CacheProvider {
    store: CacheStore,
    flights: DashMap<String, Arc<Mutex<()>>>,
}

impl CacheProvider {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            flights: DashMap::new(),
        }
    }

    /// The underlying engine.
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Current engine statistics.
    pub fn stats(&self) -> StatsSnapshot {
        self.store.stats()
    }

    // == Get ==
    /// Looks up `key` as a `T`.
    ///
    /// # Errors
    /// `Internal` if the cached value has a different type; engine errors
    /// otherwise.
    pub fn get<T>(&self, key: &str) -> Result<Option<Arc<T>>>
    where
        T: Any + Send + Sync,
    {
        match self.store.try_get(key)? {
            Some(value) => Self::downcast::<T>(key, value).map(Some),
            None => Ok(None),
        }
    }

    // == Set ==
    /// Stores `value` under `key` with `options`, replacing any previous
    /// entry.
    ///
    /// # Errors
    /// `InvalidArgument` for invalid options; engine errors otherwise.
    pub fn set<T>(&self, key: &str, value: T, options: EntryOptions) -> Result<()>
    where
        T: Any + Send + Sync,
    {
        let entry = self.store.create_entry(key)?;
        self.apply_options(&entry, &options)?;
        entry.set_value(Arc::new(value));
        entry.close();
        Ok(())
    }

    // == Remove ==
    /// Removes `key`. Returns whether an entry was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.store.remove(key)
    }

    // == Get Or Create ==
    /// Returns the cached value for `key`, or runs `factory` to produce and
    /// cache it. Concurrent callers for the same cold key share one factory
    /// run. A failed factory caches nothing.
    ///
    /// # Errors
    /// The factory's error, a type mismatch, or engine errors.
    pub fn get_or_create<T, F>(&self, key: &str, options: EntryOptions, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(cached) = self.get::<T>(key)? {
            return Ok(cached);
        }

        let flight = self
            .flights
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = flight.lock();

        // Another flight may have filled the key while we waited.
        if let Some(cached) = self.get::<T>(key)? {
            self.flights.remove(key);
            return Ok(cached);
        }

        let entry = self.store.create_entry(key)?;
        let result = self.populate(&entry, &options, factory);
        if result.is_err() {
            // Abandon the open entry so nothing gets committed.
            entry.mark_expired(crate::cache::EvictionReason::Removed);
        }
        entry.close();
        self.flights.remove(key);

        let value = result?;
        debug!(key, "factory populated entry");
        Ok(value)
    }

    fn populate<T, F>(&self, entry: &Arc<CacheEntry>, options: &EntryOptions, factory: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        self.apply_options(entry, options)?;
        if options.expiration_mode == ExpirationMode::Immediate {
            self.arm_eviction_timer(entry, options)?;
        }
        let value = Arc::new(factory()?);
        entry.set_value(value.clone());
        Ok(value)
    }

    fn apply_options(&self, entry: &Arc<CacheEntry>, options: &EntryOptions) -> Result<()> {
        if let Some(instant) = options.absolute_expiration {
            entry.set_absolute_expiration(instant);
        }
        if let Some(delta) = options.absolute_expiration_relative_to_now {
            entry.set_absolute_expiration_relative_to_now(delta)?;
        }
        if let Some(delta) = options.sliding_expiration {
            entry.set_sliding_expiration(delta)?;
        }
        entry.set_priority(options.priority);
        if let Some(size) = options.size {
            entry.set_size(size)?;
        }
        Ok(())
    }

    /// Arms a one-shot timer that fires an expiration token at the entry's
    /// deadline. Eviction for any other reason cancels the timer.
    fn arm_eviction_timer(&self, entry: &Arc<CacheEntry>, options: &EntryOptions) -> Result<()> {
        let delay = match options.absolute_expiration_relative_to_now {
            Some(delta) => delta,
            None => match options.absolute_expiration {
                Some(instant) => instant - self.store.clock().now(),
                None => return Ok(()),
            },
        };
        let delay = delay.to_std().map_err(|_| {
            CacheError::InvalidArgument("immediate expiration deadline must be in the future".to_string())
        })?;

        let token = ChangeToken::new();
        entry.add_expiration_token(token.clone());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.fire();
        });
        let abort = handle.abort_handle();
        entry.register_eviction_callback(
            move |_key, _value, _reason, _state| {
                abort.abort();
            },
            None,
        );
        Ok(())
    }

    fn downcast<T>(key: &str, value: CacheValue) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        value.downcast::<T>().map_err(|_| {
            CacheError::Internal(format!(
                "cached value for key '{}' has an unexpected type",
                key
            ))
        })
    }
}
