//! Entry Scope Module
//!
//! Thread-local stack of cache entries currently under construction. When a
//! factory building one entry performs nested cache operations, the nested
//! entries find their enclosing entry here and propagate expiration policy
//! into it. Each thread owns an independent stack; unrelated concurrent
//! operations never observe each other's frames.
//!
//! The stack is an immutable singly-linked list of `Arc` frames holding
//! `Weak` entry references, so the stack never keeps an entry alive and
//! dropping a frame chain never drops an entry (whose own guard release
//! would re-enter the stack). Releasing a guard deactivates its frame and
//! pops it by identity; a guard released on a foreign thread or during
//! thread-local teardown only deactivates, leaving every stack untouched.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use super::entry::CacheEntry;

struct ScopeFrame {
    entry: Weak<CacheEntry>,
    active: AtomicBool,
    previous: Option<Arc<ScopeFrame>>,
}

impl ScopeFrame {
    fn live_entry(&self) -> Option<Arc<CacheEntry>> {
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        self.entry.upgrade()
    }
}

thread_local! {
    static SCOPES: RefCell<Option<Arc<ScopeFrame>>> = const { RefCell::new(None) };
}

// == Enter ==
/// Pushes `entry` as the innermost open scope and returns a guard that
/// deactivates and pops the frame when released.
pub(crate) fn enter(entry: Arc<CacheEntry>) -> ScopeGuard {
    let frame = Arc::new(ScopeFrame {
        entry: Arc::downgrade(&entry),
        active: AtomicBool::new(true),
        previous: SCOPES.with(|scopes| scopes.borrow().clone()),
    });
    SCOPES.with(|scopes| {
        *scopes.borrow_mut() = Some(Arc::clone(&frame));
    });
    ScopeGuard {
        frame: Some(frame),
        owner: thread::current().id(),
    }
}

// == Current ==
/// Peeks the innermost live open entry on this thread, if any. Frames whose
/// guard has been released elsewhere, or whose entry is gone, are skipped.
pub(crate) fn current() -> Option<Arc<CacheEntry>> {
    SCOPES
        .try_with(|scopes| {
            let mut cursor = scopes.borrow().clone();
            while let Some(frame) = cursor {
                if let Some(entry) = frame.live_entry() {
                    return Some(entry);
                }
                cursor = frame.previous.clone();
            }
            None
        })
        .ok()
        .flatten()
}

// == Scope Guard ==
/// Releases the frame pushed by `enter`. Release is idempotent and safe
/// from any thread and from inside destructors.
pub(crate) struct ScopeGuard {
    frame: Option<Arc<ScopeFrame>>,
    owner: ThreadId,
}

impl ScopeGuard {
    fn restore(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        frame.active.store(false, Ordering::Release);
        if thread::current().id() != self.owner {
            // Foreign threads must never mutate the owning thread's stack;
            // the deactivated frame is skipped there and popped later.
            return;
        }
        // Pop by identity, moving displaced frames out of the cell before
        // dropping them: a drop inside the borrow could re-enter the stack.
        let displaced = SCOPES.try_with(|scopes| {
            let mut scopes = scopes.borrow_mut();
            let mut head = scopes.clone();
            // Released-out-of-order frames above ours are inactive; pop
            // through them down to our frame's predecessor.
            loop {
                let Some(top) = head.clone() else { break };
                if Arc::ptr_eq(&top, &frame) {
                    head = frame.previous.clone();
                    break;
                }
                if top.active.load(Ordering::Acquire) {
                    return None;
                }
                head = top.previous.clone();
            }
            std::mem::replace(&mut *scopes, head)
        });
        drop(displaced);
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}
