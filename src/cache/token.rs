//! Change Token Module
//!
//! External change signals that expire cache entries. A [`ChangeToken`] is a
//! cheaply cloneable handle; firing it once flips it permanently and invokes
//! every registered callback. Registrations detach themselves when dropped,
//! so an entry leaving the cache never leaks callbacks in a live token.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type ChangeCallback = Box<dyn FnOnce() + Send>;

struct TokenInner {
    fired: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, ChangeCallback>>,
}

// == Change Token ==
/// A one-shot change signal shared between a producer and any number of
/// cache entries.
#[derive(Clone)]
pub struct ChangeToken {
    inner: Arc<TokenInner>,
}

impl ChangeToken {
    /// Creates a fresh, unfired token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                fired: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Whether this token has fired.
    pub fn has_changed(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Whether registered callbacks are invoked when the token fires.
    /// Always true for this token type.
    pub fn supports_active_callbacks(&self) -> bool {
        true
    }

    /// Fires the token. The first call wins; callbacks run exactly once, on
    /// the firing thread, after the callback list lock has been released.
    pub fn fire(&self) {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks: Vec<ChangeCallback> = {
            let mut registered = self.inner.callbacks.lock();
            registered.drain().map(|(_, cb)| cb).collect()
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Registers a callback to run when the token fires. If the token has
    /// already fired the callback runs immediately on the calling thread.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> TokenRegistration {
        if self.has_changed() {
            callback();
            return TokenRegistration {
                token: self.clone(),
                id: None,
            };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.lock().insert(id, Box::new(callback));
        // A fire that raced the insert above drained before we inserted;
        // honor the registration by invoking now.
        if self.has_changed() {
            if let Some(cb) = self.inner.callbacks.lock().remove(&id) {
                cb();
            }
            return TokenRegistration {
                token: self.clone(),
                id: None,
            };
        }
        TokenRegistration {
            token: self.clone(),
            id: Some(id),
        }
    }
}

impl Default for ChangeToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeToken")
            .field("fired", &self.has_changed())
            .finish()
    }
}

// == Token Registration ==
/// Handle for a registered change callback. Dropping it detaches the
/// callback; detaching twice is a no-op.
pub struct TokenRegistration {
    token: ChangeToken,
    id: Option<u64>,
}

impl TokenRegistration {
    /// Removes the callback from the token if it has not yet run.
    pub fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            self.token.inner.callbacks.lock().remove(&id);
        }
    }
}

impl Drop for TokenRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for TokenRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRegistration")
            .field("attached", &self.id.is_some())
            .finish()
    }
}
