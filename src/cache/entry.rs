//! Cache Entry Module
//!
//! A single cache slot: value, expiration policy, priority, size cost, and
//! lifecycle bookkeeping. Entries are created uncommitted by the engine,
//! configured and filled by their owning computation, then committed into
//! the table when closed. Shared interior state sits behind a small
//! `parking_lot` mutex; hot flags (expired, reason, last-accessed) are
//! atomics so readers never contend with writers.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::warn;

use super::scope::ScopeGuard;
use super::store::StoreInner;
use super::token::{ChangeToken, TokenRegistration};
use super::{scope, MAX_KEY_LENGTH};
use crate::error::{CacheError, Result};

// == Value & Callback Types ==
/// Payload stored in an entry. `Arc<dyn Any>` keeps the engine untyped; the
/// provider facade restores the concrete type at the boundary.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Opaque state handed back to an eviction callback.
pub type CallbackState = Arc<dyn Any + Send + Sync>;

type EvictionCallback =
    Box<dyn FnOnce(String, Option<CacheValue>, EvictionReason, Option<CallbackState>) + Send>;

struct EvictionCallbackRegistration {
    callback: EvictionCallback,
    state: Option<CallbackState>,
}

// == Cache Priority ==
/// Governs eviction order during compaction. `NeverRemove` entries are
/// exempt from capacity eviction entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
    NeverRemove,
}

// == Eviction Reason ==
/// Why an entry left the table. Set exactly once; the first writer wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    None,
    Removed,
    Replaced,
    Expired,
    TokenExpired,
    Capacity,
}

impl EvictionReason {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            EvictionReason::None => 0,
            EvictionReason::Removed => 1,
            EvictionReason::Replaced => 2,
            EvictionReason::Expired => 3,
            EvictionReason::TokenExpired => 4,
            EvictionReason::Capacity => 5,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => EvictionReason::Removed,
            2 => EvictionReason::Replaced,
            3 => EvictionReason::Expired,
            4 => EvictionReason::TokenExpired,
            5 => EvictionReason::Capacity,
            _ => EvictionReason::None,
        }
    }
}

// == Entry State ==
struct EntryState {
    value: Option<CacheValue>,
    absolute_expiration: Option<DateTime<Utc>>,
    absolute_expiration_relative_to_now: Option<TimeDelta>,
    sliding_expiration: Option<TimeDelta>,
    priority: CachePriority,
    size: Option<i64>,
    expiration_tokens: Vec<ChangeToken>,
    token_registrations: Vec<TokenRegistration>,
    // Some until claimed by the first eviction path; claiming takes the
    // whole list so callbacks can never double-fire.
    eviction_callbacks: Option<Vec<EvictionCallbackRegistration>>,
    scope: Option<ScopeGuard>,
}

// == Cache Entry ==
/// One cache slot. Cheap to share (`Arc`); safe to mutate concurrently.
pub struct CacheEntry {
    key: String,
    store: Weak<StoreInner>,
    closed: AtomicBool,
    expired: AtomicBool,
    reason: AtomicU8,
    last_accessed: AtomicI64,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an uncommitted entry bound to the engine's commit and
    /// expiration-notification hooks.
    pub(crate) fn new(key: String, store: Weak<StoreInner>) -> Arc<Self> {
        Arc::new(Self {
            key,
            store,
            closed: AtomicBool::new(false),
            expired: AtomicBool::new(false),
            reason: AtomicU8::new(EvictionReason::None.as_u8()),
            last_accessed: AtomicI64::new(0),
            state: Mutex::new(EntryState {
                value: None,
                absolute_expiration: None,
                absolute_expiration_relative_to_now: None,
                sliding_expiration: None,
                priority: CachePriority::default(),
                size: None,
                expiration_tokens: Vec::new(),
                token_registrations: Vec::new(),
                eviction_callbacks: Some(Vec::new()),
                scope: None,
            }),
        })
    }

    // == Accessors ==
    /// The entry's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The stored value, if one has been set.
    pub fn value(&self) -> Option<CacheValue> {
        self.state.lock().value.clone()
    }

    /// Sets the payload. The engine expects this to happen exactly once,
    /// before `close`.
    pub fn set_value(&self, value: CacheValue) {
        self.state.lock().value = Some(value);
    }

    /// Current eviction reason, `None` until the entry is expired.
    pub fn eviction_reason(&self) -> EvictionReason {
        EvictionReason::from_u8(self.reason.load(Ordering::Acquire))
    }

    /// The entry's eviction priority.
    pub fn priority(&self) -> CachePriority {
        self.state.lock().priority
    }

    /// Sets the eviction priority.
    pub fn set_priority(&self, priority: CachePriority) {
        self.state.lock().priority = priority;
    }

    /// The entry's size cost, if set.
    pub fn size(&self) -> Option<i64> {
        self.state.lock().size
    }

    /// Sets the size cost.
    ///
    /// # Errors
    /// `InvalidArgument` if `size` is negative.
    pub fn set_size(&self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(CacheError::InvalidArgument(
                "size must be non-negative".to_string(),
            ));
        }
        self.state.lock().size = Some(size);
        Ok(())
    }

    /// The absolute expiration instant, if set.
    pub fn absolute_expiration(&self) -> Option<DateTime<Utc>> {
        self.state.lock().absolute_expiration
    }

    /// Sets an absolute expiration instant.
    pub fn set_absolute_expiration(&self, instant: DateTime<Utc>) {
        self.state.lock().absolute_expiration = Some(instant);
    }

    /// Sets an absolute expiration as an offset from the commit instant.
    ///
    /// # Errors
    /// `InvalidArgument` if `delta` is not strictly positive.
    pub fn set_absolute_expiration_relative_to_now(&self, delta: TimeDelta) -> Result<()> {
        if delta <= TimeDelta::zero() {
            return Err(CacheError::InvalidArgument(
                "relative expiration must be positive".to_string(),
            ));
        }
        self.state.lock().absolute_expiration_relative_to_now = Some(delta);
        Ok(())
    }

    /// The sliding expiration window, if set.
    pub fn sliding_expiration(&self) -> Option<TimeDelta> {
        self.state.lock().sliding_expiration
    }

    /// Sets how long the entry may go unaccessed before expiring. Never
    /// extends the lifetime past the absolute expiration.
    ///
    /// # Errors
    /// `InvalidArgument` if `delta` is not strictly positive.
    pub fn set_sliding_expiration(&self, delta: TimeDelta) -> Result<()> {
        if delta <= TimeDelta::zero() {
            return Err(CacheError::InvalidArgument(
                "sliding expiration must be positive".to_string(),
            ));
        }
        self.state.lock().sliding_expiration = Some(delta);
        Ok(())
    }

    /// Adds an external change signal; the entry expires when it fires.
    pub fn add_expiration_token(&self, token: ChangeToken) {
        self.state.lock().expiration_tokens.push(token);
    }

    /// Registers a callback fired once, off the evicting thread, after the
    /// entry leaves the cache.
    pub fn register_eviction_callback<F>(&self, callback: F, state: Option<CallbackState>)
    where
        F: FnOnce(String, Option<CacheValue>, EvictionReason, Option<CallbackState>)
            + Send
            + 'static,
    {
        let registration = EvictionCallbackRegistration {
            callback: Box::new(callback),
            state,
        };
        let mut entry_state = self.state.lock();
        match entry_state.eviction_callbacks.as_mut() {
            Some(callbacks) => callbacks.push(registration),
            None => entry_state.eviction_callbacks = Some(vec![registration]),
        }
    }

    // == Last Accessed ==
    /// Instant of the last successful read or commit.
    pub fn last_accessed(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_accessed.load(Ordering::Acquire))
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub(crate) fn set_last_accessed(&self, now: DateTime<Utc>) {
        self.last_accessed
            .store(now.timestamp_millis(), Ordering::Release);
    }

    // == Expiration ==
    /// Whether the entry is expired at `now`. Checking has teeth: the first
    /// failing policy marks the entry expired with its reason.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired.load(Ordering::Acquire)
            || self.check_expired_time(now)
            || self.check_expired_tokens()
    }

    /// Marks the entry expired. The reason field is first-write-wins; token
    /// registrations are always detached, even on repeat calls.
    pub fn mark_expired(&self, reason: EvictionReason) {
        let _ = self.reason.compare_exchange(
            EvictionReason::None.as_u8(),
            reason.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.expired.store(true, Ordering::Release);
        self.detach_tokens();
    }

    fn check_expired_time(&self, now: DateTime<Utc>) -> bool {
        let (absolute, sliding) = {
            let state = self.state.lock();
            (state.absolute_expiration, state.sliding_expiration)
        };
        if absolute.is_some_and(|instant| instant <= now) {
            self.mark_expired(EvictionReason::Expired);
            return true;
        }
        if sliding.is_some_and(|window| now.signed_duration_since(self.last_accessed()) >= window)
        {
            self.mark_expired(EvictionReason::Expired);
            return true;
        }
        false
    }

    fn check_expired_tokens(&self) -> bool {
        let tokens = { self.state.lock().expiration_tokens.clone() };
        if tokens.iter().any(|token| token.has_changed()) {
            self.mark_expired(EvictionReason::TokenExpired);
            return true;
        }
        false
    }

    /// Resolves the relative expiration to an absolute instant at commit
    /// time; an earlier explicit absolute expiration wins.
    pub(crate) fn resolve_absolute_expiration(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(delta) = state.absolute_expiration_relative_to_now {
            let candidate = now + delta;
            if state
                .absolute_expiration
                .map_or(true, |absolute| candidate < absolute)
            {
                state.absolute_expiration = Some(candidate);
            }
        }
    }

    // == Token Plumbing ==
    /// Registers change callbacks on every attached token that supports
    /// active notification. A firing token marks the entry expired and
    /// notifies the engine on a worker thread, never synchronously on the
    /// firing thread.
    pub(crate) fn attach_tokens(self: &Arc<Self>) {
        let tokens = { self.state.lock().expiration_tokens.clone() };
        if tokens.is_empty() {
            return;
        }
        let mut registrations = Vec::with_capacity(tokens.len());
        for token in tokens {
            if !token.supports_active_callbacks() {
                continue;
            }
            let weak_entry = Arc::downgrade(self);
            registrations.push(token.register(move || {
                std::thread::spawn(move || {
                    if let Some(entry) = weak_entry.upgrade() {
                        entry.mark_expired(EvictionReason::TokenExpired);
                        if let Some(store) = entry.store.upgrade() {
                            store.notify_expired(&entry);
                        }
                    }
                });
            }));
        }
        self.state.lock().token_registrations.extend(registrations);
    }

    fn detach_tokens(&self) {
        // Take under the lock, drop outside it; registration drops take the
        // token's own lock and must not nest inside ours.
        let registrations = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.token_registrations)
        };
        drop(registrations);
    }

    // == Scope ==
    pub(crate) fn set_scope(&self, guard: ScopeGuard) {
        self.state.lock().scope = Some(guard);
    }

    // == Close ==
    /// Closes the entry: releases its scope frame, commits it into the
    /// engine, and propagates expiration policy into the enclosing open
    /// entry. Idempotent; only the first call has any effect.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let scope_guard = { self.state.lock().scope.take() };
        drop(scope_guard);
        if let Some(store) = self.store.upgrade() {
            store.commit(self);
        }
        if let Some(parent) = scope::current() {
            if !Arc::ptr_eq(self, &parent) {
                self.propagate_to_parent(&parent);
            }
        }
    }

    // == Policy Propagation ==
    /// Copies this entry's expiration tokens into `parent` and tightens the
    /// parent's absolute expiration if ours is earlier. The child's state is
    /// snapshotted under its own lock first; the child lock is never held
    /// while taking the parent's, so concurrently closing nested entries
    /// cannot invert lock order.
    pub(crate) fn propagate_to_parent(&self, parent: &Arc<CacheEntry>) {
        let (tokens, absolute) = {
            let state = self.state.lock();
            (state.expiration_tokens.clone(), state.absolute_expiration)
        };
        if tokens.is_empty() && absolute.is_none() {
            return;
        }
        let mut parent_state = parent.state.lock();
        parent_state.expiration_tokens.extend(tokens);
        if let Some(absolute) = absolute {
            let adopt = parent_state
                .absolute_expiration
                .map_or(true, |parent_absolute| absolute < parent_absolute);
            if adopt {
                parent_state.absolute_expiration = Some(absolute);
            }
        }
    }

    // == Eviction Callbacks ==
    /// Fires the registered eviction callbacks exactly once, on a worker
    /// thread. The callback list is claimed atomically, so racing eviction
    /// paths cannot double-fire. Panicking callbacks are logged, never
    /// propagated, and never abort their siblings.
    pub(crate) fn invoke_eviction_callbacks(self: &Arc<Self>) {
        let callbacks = { self.state.lock().eviction_callbacks.take() };
        let Some(callbacks) = callbacks else { return };
        if callbacks.is_empty() {
            return;
        }
        let entry = Arc::clone(self);
        std::thread::spawn(move || {
            let value = entry.value();
            let reason = entry.eviction_reason();
            for registration in callbacks {
                let key = entry.key.clone();
                let value = value.clone();
                let state = registration.state;
                let callback = registration.callback;
                let outcome = catch_unwind(AssertUnwindSafe(move || {
                    callback(key, value, reason, state);
                }));
                if outcome.is_err() {
                    warn!(key = %entry.key, "eviction callback panicked");
                }
            }
        });
    }

    // == Validation Helper ==
    pub(crate) fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument(
                "key must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::InvalidArgument(format!(
                "key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("expired", &self.expired.load(Ordering::Relaxed))
            .field("reason", &self.eviction_reason())
            .finish()
    }
}
