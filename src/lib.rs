//! memstash
//!
//! In-process cache engine with expiration, priority-based eviction under a
//! size cap, nested-entry scope propagation, a content-addressed backing
//! store, and a typed get-or-create provider — plus a small HTTP server
//! exposing it.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod provider;
pub mod storage;
pub mod tasks;

pub use cache::{
    CacheEntry, CachePriority, CacheStore, CacheValue, EvictionReason, StatsSnapshot,
};
pub use config::{CacheConfig, Config};
pub use error::{CacheError, Result};
pub use provider::{CacheProvider, EntryOptions, ExpirationMode};
pub use storage::DiskStorage;
