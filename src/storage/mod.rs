//! Storage Module
//!
//! Content-addressed backing store: key hashing and the on-disk file layout.

pub mod disk;
pub mod hasher;

pub use disk::{DiskStorage, CACHE_ENTRY_SUFFIX};
pub use hasher::content_address;
