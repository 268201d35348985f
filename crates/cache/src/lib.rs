//! Thumbgrid Cache Library
//!
//! Bounded thumbnail cache with coalescing waiters, reference counting, LRU
//! trimming and TTL cleanup.

mod eviction;
pub mod store;

pub use store::{CacheEntry, CacheStats, CacheStore, EntryState, ThumbnailKey, Waiter};
