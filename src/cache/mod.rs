//! Cache Module
//!
//! Core in-memory cache engine: entries, expiration tokens, nested entry
//! scopes, the concurrent store, and statistics.

pub mod clock;
pub mod entry;
pub(crate) mod scope;
pub mod stats;
pub mod store;
pub mod token;


pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{
    CacheEntry, CachePriority, CacheValue, CallbackState, EvictionReason,
};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::CacheStore;
pub use token::{ChangeToken, TokenRegistration};

/// Maximum accepted key length, in bytes.
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum accepted value payload over the HTTP surface, in bytes.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;
