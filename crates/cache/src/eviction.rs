//! Eviction policy
//!
//! Two triggers reclaim entries that no mounted cell displays:
//! - size-triggered [`CacheStore::trim`], oldest access first, down to the cap
//! - time-triggered [`CacheStore::cleanup_expired`], settled entries idle
//!   longer than the configured timeout
//!
//! Entries with a non-zero reference count are never candidates, and neither
//! are entries an in-flight fetch, a scheduled retry or a waiter depends on.

use crate::store::{CacheStore, ThumbnailKey};
use std::time::{Duration, Instant};

impl<H: Clone, E: Clone, P: Copy + Default> CacheStore<H, E, P> {
    /// Whether the store currently holds more entries than its cap
    pub fn is_over_capacity(&self) -> bool {
        self.entries.len() > self.max_entries
    }

    /// Trim the store back toward its cap.
    ///
    /// Unreferenced, idle entries are removed in ascending last-access order
    /// until the size is at most the cap. If every remaining entry is
    /// referenced or busy the store stays above the cap. Returns the evicted
    /// keys.
    pub fn trim(&mut self) -> Vec<ThumbnailKey> {
        if !self.is_over_capacity() {
            return Vec::new();
        }

        let excess = self.entries.len() - self.max_entries;
        let mut candidates: Vec<(Instant, ThumbnailKey)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.ref_count() == 0 && !entry.is_busy())
            .map(|(key, entry)| (entry.last_access(), key.clone()))
            .collect();
        candidates.sort();

        let evicted: Vec<ThumbnailKey> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, key)| key)
            .collect();

        for key in &evicted {
            self.entries.remove(key);
        }
        self.stats.entries = self.entries.len();
        self.stats.evictions += evicted.len() as u64;

        if !evicted.is_empty() {
            tracing::debug!(
                evicted = evicted.len(),
                remaining = self.entries.len(),
                cap = self.max_entries,
                "trimmed thumbnail cache"
            );
        }
        evicted
    }

    /// Remove settled entries idle for longer than `timeout` as of `now`.
    ///
    /// An entry exactly `timeout` old is kept. Returns the number removed.
    pub fn cleanup_expired(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let expired = entry.is_settled()
                && entry.ref_count() == 0
                && !entry.is_busy()
                && now.saturating_duration_since(entry.last_access()) > timeout;
            !expired
        });
        let removed = before - self.entries.len();
        self.stats.entries = self.entries.len();
        self.stats.expirations += removed as u64;

        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "expired idle thumbnails");
        }
        removed
    }

    /// Remove every entry no fetch or requester depends on.
    pub fn clear(&mut self) -> usize {
        self.invalidate(|_| true).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntryState;
    use rand::Rng;
    use std::collections::HashSet;

    type Store = CacheStore<String, String, u8>;

    fn key(i: usize) -> ThumbnailKey {
        ThumbnailKey::new(format!("wafer_{i:04}.png"), 512)
    }

    fn ready(store: &mut Store, k: &ThumbnailKey) {
        store.mark_pending(k, 1);
        store.resolve(k, Ok(k.path.clone()));
    }

    #[test]
    fn test_trim_noop_under_cap() {
        let mut store = Store::new(4);
        for i in 0..4 {
            ready(&mut store, &key(i));
        }
        assert!(store.trim().is_empty());
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_trim_oldest_first() {
        let mut store = Store::new(2);
        for i in 0..4 {
            ready(&mut store, &key(i));
            std::thread::sleep(Duration::from_millis(2));
        }
        // Accessing key 0 makes it the most recent
        store.touch(&key(0));

        let evicted = store.trim();
        assert_eq!(evicted, vec![key(1), key(2)]);
        assert!(store.contains(&key(0)));
        assert!(store.contains(&key(3)));
        assert_eq!(store.stats().evictions, 2);
    }

    #[test]
    fn test_trim_skips_referenced_and_pending() {
        let mut store = Store::new(1);
        ready(&mut store, &key(0));
        store.acquire(&key(0));
        store.mark_pending(&key(1), 1);
        ready(&mut store, &key(2));

        let evicted = store.trim();
        assert_eq!(evicted, vec![key(2)]);
        // Nothing else is evictable, so the store stays above its cap
        assert_eq!(store.len(), 2);
        assert!(store.is_over_capacity());
    }

    #[test]
    fn test_trim_randomized_invariants() {
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            let cap = rng.gen_range(1..20);
            let total = rng.gen_range(0..60);
            let mut store = Store::new(cap);
            let mut referenced = HashSet::new();

            for i in 0..total {
                ready(&mut store, &key(i));
                if rng.gen_bool(0.2) {
                    store.acquire(&key(i));
                    referenced.insert(key(i));
                }
            }

            let evicted = store.trim();
            for k in &evicted {
                assert!(!referenced.contains(k), "evicted a referenced entry");
            }
            for k in &referenced {
                assert!(store.contains(k));
            }
            if referenced.len() <= cap {
                assert!(store.len() <= cap);
            } else {
                assert_eq!(store.len(), referenced.len());
            }
        }
    }

    #[test]
    fn test_cleanup_respects_timeout_boundary() {
        let timeout = Duration::from_millis(900_000);
        let mut store = Store::new(10);
        ready(&mut store, &key(0));
        let resolved_at = store.get(&key(0)).unwrap().resolved_at().unwrap();

        let removed = store.cleanup_expired(resolved_at + Duration::from_millis(899_999), timeout);
        assert_eq!(removed, 0);
        assert!(store.contains(&key(0)));

        let removed = store.cleanup_expired(resolved_at + Duration::from_millis(900_001), timeout);
        assert_eq!(removed, 1);
        assert!(!store.contains(&key(0)));
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn test_cleanup_keeps_displayed_entries() {
        let timeout = Duration::from_millis(900_000);
        let mut store = Store::new(10);
        ready(&mut store, &key(0));
        store.acquire(&key(0));
        let resolved_at = store.get(&key(0)).unwrap().resolved_at().unwrap();

        let far_future = resolved_at + Duration::from_secs(24 * 3600);
        assert_eq!(store.cleanup_expired(far_future, timeout), 0);
        assert!(store.contains(&key(0)));

        store.release(&key(0));
        assert_eq!(store.cleanup_expired(far_future, timeout), 1);
    }

    #[test]
    fn test_cleanup_removes_failed_but_not_pending() {
        let timeout = Duration::from_secs(1);
        let mut store = Store::new(10);
        store.mark_pending(&key(0), 1);
        store.resolve(&key(0), Err("404".to_string()));
        store.mark_pending(&key(1), 1);
        store.reserve(&key(2));

        let later = Instant::now() + Duration::from_secs(10);
        assert_eq!(store.cleanup_expired(later, timeout), 1);
        assert!(!store.contains(&key(0)));
        assert_eq!(store.get(&key(1)).unwrap().state(), EntryState::Pending);
        assert_eq!(store.get(&key(2)).unwrap().state(), EntryState::Empty);
    }

    #[test]
    fn test_clear_keeps_pending() {
        let mut store = Store::new(10);
        ready(&mut store, &key(0));
        store.mark_pending(&key(1), 1);

        assert_eq!(store.clear(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&key(1)));
    }
}
