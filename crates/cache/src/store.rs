//! Thumbnail cache store
//!
//! A bounded map from `(resource path, size)` to a cache entry. Each entry
//! carries its lifecycle state, the resolved handle, the last-known priority,
//! timestamps used for LRU/TTL decisions, a reference count of the grid cells
//! currently displaying it, and the waiters coalesced onto its single fetch.
//!
//! The store is not internally synchronized. It is meant to live inside the
//! loader's single state mutex so that queue, counter and cache mutations are
//! atomic with respect to each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Instant;

/// Identifies one cached thumbnail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThumbnailKey {
    /// Resource path as understood by the thumbnail endpoint
    pub path: String,

    /// Requested edge length in pixels
    pub size: u32,
}

impl ThumbnailKey {
    /// Create a new key
    pub fn new(path: impl Into<String>, size: u32) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

impl fmt::Display for ThumbnailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.size)
    }
}

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Known but never fetched (or returned here by a reset)
    Empty,

    /// A fetch has been admitted and has not settled yet
    Pending,

    /// The fetch succeeded and a handle is available
    Ready,

    /// The fetch failed; may still have one retry scheduled
    Failed,
}

/// Channel end used to hand a settled result to one coalesced requester.
pub type Waiter<H, E> = Sender<Result<H, E>>;

/// One cached unit for a given key.
#[derive(Debug)]
pub struct CacheEntry<H, E, P> {
    state: EntryState,
    handle: Option<H>,
    error: Option<E>,
    priority: P,
    generation: u64,
    attempts: u32,
    retry_scheduled: bool,
    enqueued_at: Option<Instant>,
    resolved_at: Option<Instant>,
    last_access: Instant,
    ref_count: usize,
    waiters: Vec<Waiter<H, E>>,
}

impl<H: Clone, E: Clone, P: Copy + Default> CacheEntry<H, E, P> {
    fn new() -> Self {
        Self {
            state: EntryState::Empty,
            handle: None,
            error: None,
            priority: P::default(),
            generation: 0,
            attempts: 0,
            retry_scheduled: false,
            enqueued_at: None,
            resolved_at: None,
            last_access: Instant::now(),
            ref_count: 0,
            waiters: Vec::new(),
        }
    }

    /// Rebuild an entry that was found in an impossible state.
    ///
    /// References and waiters belong to live cells and requesters, so they
    /// survive; everything describing the fetch is dropped.
    fn recreated(self) -> Self {
        Self {
            ref_count: self.ref_count,
            waiters: self.waiters,
            priority: self.priority,
            ..Self::new()
        }
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Resolved handle, present only when `Ready`
    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    /// Last failure, present only when `Failed`
    pub fn error(&self) -> Option<&E> {
        self.error.as_ref()
    }

    /// Result as it would be delivered to a requester, if settled for good.
    pub fn outcome(&self) -> Option<Result<H, E>> {
        match self.state {
            EntryState::Ready => self.handle.clone().map(Ok),
            EntryState::Failed if !self.retry_scheduled => self.error.clone().map(Err),
            _ => None,
        }
    }

    pub fn priority(&self) -> P {
        self.priority
    }

    /// Generation of the fetch that last moved this entry to `Pending`
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of fetch attempts made since the entry was last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_scheduled(&self) -> bool {
        self.retry_scheduled
    }

    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    pub fn resolved_at(&self) -> Option<Instant> {
        self.resolved_at
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Number of mounted cells displaying this entry
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Whether the entry has settled and will not change without a new fetch
    pub fn is_settled(&self) -> bool {
        match self.state {
            EntryState::Ready => true,
            EntryState::Failed => !self.retry_scheduled,
            EntryState::Empty | EntryState::Pending => false,
        }
    }

    /// Whether a queued or running fetch, a retry or a requester still
    /// depends on this entry.
    pub fn is_busy(&self) -> bool {
        self.state == EntryState::Pending
            || self.enqueued_at.is_some()
            || self.retry_scheduled
            || !self.waiters.is_empty()
    }

    fn notify(&mut self, result: &Result<H, E>) -> usize {
        let waiters = std::mem::take(&mut self.waiters);
        let count = waiters.len();
        for waiter in waiters {
            // The requester may have given up on its ticket
            let _ = waiter.send(result.clone());
        }
        count
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently stored (any state)
    pub entries: usize,

    /// Configured entry cap
    pub max_entries: usize,

    /// Requests served from a `Ready` entry
    pub hits: u64,

    /// Fetches that had to be admitted
    pub misses: u64,

    /// Entries removed by size-triggered trimming
    pub evictions: u64,

    /// Entries removed by time-triggered cleanup
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate entry utilization (0.0 to 1.0+)
    pub fn utilization(&self) -> f64 {
        if self.max_entries == 0 {
            0.0
        } else {
            self.entries as f64 / self.max_entries as f64
        }
    }
}

/// Bounded key to entry map with coalescing waiters.
///
/// `H` is the resolved handle, `E` the failure type and `P` the priority tier
/// recorded on each entry.
///
/// # Example
///
/// ```
/// use thumbgrid_cache::{CacheStore, EntryState, ThumbnailKey};
///
/// let mut store: CacheStore<String, String, u8> = CacheStore::new(100);
/// let key = ThumbnailKey::new("lot1/wafer_001.png", 512);
///
/// store.reserve(&key);
/// store.mark_pending(&key, 1);
/// store.resolve(&key, Ok("bytes".to_string()));
///
/// assert_eq!(store.get(&key).unwrap().state(), EntryState::Ready);
/// ```
#[derive(Debug)]
pub struct CacheStore<H, E, P> {
    pub(crate) entries: HashMap<ThumbnailKey, CacheEntry<H, E, P>>,
    pub(crate) max_entries: usize,
    pub(crate) stats: CacheStats,
}

impl<H: Clone, E: Clone, P: Copy + Default> CacheStore<H, E, P> {
    /// Create an empty store capped at `max_entries`
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            stats: CacheStats {
                max_entries,
                ..Default::default()
            },
        }
    }

    /// Pure lookup. Never fetches and never updates LRU state.
    pub fn get(&self, key: &ThumbnailKey) -> Option<&CacheEntry<H, E, P>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &ThumbnailKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Return the existing entry or create an `Empty` one. Idempotent.
    pub fn reserve(&mut self, key: &ThumbnailKey) -> &mut CacheEntry<H, E, P> {
        if !self.entries.contains_key(key) {
            self.stats.entries = self.entries.len() + 1;
        }
        self.entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new)
    }

    /// Record that the key now sits in an admission queue at `priority`.
    pub fn mark_enqueued(&mut self, key: &ThumbnailKey, priority: P) {
        let entry = self.reserve(key);
        entry.priority = priority;
        if entry.enqueued_at.is_none() {
            entry.enqueued_at = Some(Instant::now());
        }
    }

    /// Update the last-known priority without touching anything else.
    pub fn set_priority(&mut self, key: &ThumbnailKey, priority: P) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.priority = priority;
        }
    }

    /// Record that the key left the admission queue without being fetched.
    pub fn mark_dequeued(&mut self, key: &ThumbnailKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.enqueued_at = None;
        }
    }

    /// Transition `Empty`/`Failed` to `Pending` for a fetch of `generation`.
    ///
    /// Any other starting state is an inconsistency: the entry is rebuilt
    /// rather than reported.
    pub fn mark_pending(&mut self, key: &ThumbnailKey, generation: u64) {
        self.repair_if(key, |state| {
            matches!(state, EntryState::Pending | EntryState::Ready)
        });
        let entry = self.reserve(key);
        entry.state = EntryState::Pending;
        entry.generation = generation;
        entry.attempts += 1;
        entry.retry_scheduled = false;
        entry.enqueued_at = None;
        self.stats.misses += 1;
    }

    /// Attach a requester to the entry's eventual result.
    pub fn add_waiter(&mut self, key: &ThumbnailKey, waiter: Waiter<H, E>) {
        self.reserve(key).waiters.push(waiter);
    }

    /// Settle a pending fetch and notify every coalesced waiter.
    ///
    /// Returns the number of waiters notified. Replacing a previous handle
    /// drops it here, which is the only place a handle is released besides
    /// removal.
    pub fn resolve(&mut self, key: &ThumbnailKey, result: Result<H, E>) -> usize {
        self.repair_if(key, |state| state != EntryState::Pending);
        let entry = self.reserve(key);
        let now = Instant::now();
        match &result {
            Ok(handle) => {
                entry.state = EntryState::Ready;
                entry.handle = Some(handle.clone());
                entry.error = None;
            }
            Err(error) => {
                entry.state = EntryState::Failed;
                entry.handle = None;
                entry.error = Some(error.clone());
            }
        }
        entry.retry_scheduled = false;
        entry.resolved_at = Some(now);
        entry.last_access = now;
        entry.notify(&result)
    }

    /// Record a failed attempt that will be retried. Waiters stay attached.
    pub fn mark_retrying(&mut self, key: &ThumbnailKey, error: E) {
        let entry = self.reserve(key);
        entry.state = EntryState::Failed;
        entry.handle = None;
        entry.error = Some(error);
        entry.retry_scheduled = true;
    }

    /// Return a pending entry to `Empty` without settling it.
    ///
    /// Waiters stay attached for the next attempt, and the aborted attempt
    /// does not count towards the retry budget.
    pub fn abandon(&mut self, key: &ThumbnailKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.state == EntryState::Pending {
                entry.state = EntryState::Empty;
                entry.attempts = entry.attempts.saturating_sub(1);
            }
        }
    }

    /// Return the entry to `Empty`, failing every waiter with `reason`.
    ///
    /// Used for queued keys dropped by a reset and for fetches cancelled
    /// before they produced a result.
    pub fn reset_to_empty(&mut self, key: &ThumbnailKey, reason: E) -> usize {
        let Some(entry) = self.entries.get_mut(key) else {
            return 0;
        };
        entry.state = EntryState::Empty;
        entry.handle = None;
        entry.error = None;
        entry.retry_scheduled = false;
        entry.enqueued_at = None;
        entry.attempts = 0;
        entry.notify(&Err(reason))
    }

    /// Mark a displayed entry as recently used.
    ///
    /// Returns `true` (and counts a hit) when the entry is `Ready`.
    pub fn touch(&mut self, key: &ThumbnailKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.last_access = Instant::now();
        if entry.state == EntryState::Ready {
            self.stats.hits += 1;
            true
        } else {
            false
        }
    }

    /// A cell started displaying this key.
    pub fn acquire(&mut self, key: &ThumbnailKey) -> usize {
        let entry = self.reserve(key);
        entry.ref_count += 1;
        entry.ref_count
    }

    /// A cell stopped displaying this key.
    pub fn release(&mut self, key: &ThumbnailKey) -> usize {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.ref_count
            }
            None => 0,
        }
    }

    /// Remove one entry unconditionally
    pub fn remove(&mut self, key: &ThumbnailKey) -> Option<CacheEntry<H, E, P>> {
        let removed = self.entries.remove(key);
        self.stats.entries = self.entries.len();
        removed
    }

    /// Forget every entry matching `predicate` that no fetch or requester
    /// still depends on. Returns the invalidated keys.
    ///
    /// Unreferenced entries are removed. Entries still displayed by a cell
    /// are emptied in place so their reference counts survive.
    pub fn invalidate<F>(&mut self, predicate: F) -> Vec<ThumbnailKey>
    where
        F: Fn(&ThumbnailKey) -> bool,
    {
        let doomed: Vec<ThumbnailKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_busy() && predicate(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            let Some(entry) = self.entries.remove(key) else {
                continue;
            };
            if entry.ref_count > 0 {
                self.entries.insert(key.clone(), entry.recreated());
            }
        }
        self.stats.entries = self.entries.len();
        doomed
    }

    /// Keys of every entry in the given state
    pub fn keys_in_state(&self, state: EntryState) -> Vec<ThumbnailKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == state)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Change the cap. Call `trim()` afterwards to enforce it.
    pub fn set_max_entries(&mut self, max_entries: usize) {
        self.max_entries = max_entries;
        self.stats.max_entries = max_entries;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn repair_if<F>(&mut self, key: &ThumbnailKey, broken: F)
    where
        F: Fn(EntryState) -> bool,
    {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        let entry = if broken(entry.state) {
            tracing::warn!(%key, state = ?entry.state, "recreating cache entry in unexpected state");
            entry.recreated()
        } else {
            entry
        };
        self.entries.insert(key.clone(), entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    type Store = CacheStore<String, String, u8>;

    fn key(name: &str) -> ThumbnailKey {
        ThumbnailKey::new(name, 512)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(key("a/b.png").to_string(), "a/b.png@512");
        assert_ne!(ThumbnailKey::new("a.png", 256), ThumbnailKey::new("a.png", 512));
    }

    #[test]
    fn test_get_is_pure() {
        let store = Store::new(10);
        assert!(store.get(&key("missing")).is_none());
        assert!(store.is_empty());
        assert_eq!(store.stats().misses, 0);
    }

    #[test]
    fn test_reserve_idempotent() {
        let mut store = Store::new(10);
        store.reserve(&key("a")).ref_count += 1;
        store.reserve(&key("a"));

        assert_eq!(store.len(), 1);
        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Empty);
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn test_lifecycle_ready() {
        let mut store = Store::new(10);
        store.reserve(&key("a"));
        store.mark_pending(&key("a"), 3);

        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Pending);
        assert_eq!(entry.generation(), 3);
        assert_eq!(entry.attempts(), 1);

        store.resolve(&key("a"), Ok("handle".to_string()));
        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Ready);
        assert_eq!(entry.handle().map(String::as_str), Some("handle"));
        assert!(entry.resolved_at().is_some());
        assert!(entry.is_settled());
    }

    #[test]
    fn test_resolve_notifies_all_waiters() {
        let mut store = Store::new(10);
        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();

        store.mark_pending(&key("a"), 1);
        store.add_waiter(&key("a"), tx1);
        store.add_waiter(&key("a"), tx2);

        let notified = store.resolve(&key("a"), Ok("h".to_string()));
        assert_eq!(notified, 2);
        assert_eq!(rx1.recv().unwrap(), Ok("h".to_string()));
        assert_eq!(rx2.recv().unwrap(), Ok("h".to_string()));
        assert_eq!(store.get(&key("a")).unwrap().waiter_count(), 0);
    }

    #[test]
    fn test_dropped_waiter_does_not_break_resolve() {
        let mut store = Store::new(10);
        let (tx, rx) = mpsc::channel();
        drop(rx);

        store.mark_pending(&key("a"), 1);
        store.add_waiter(&key("a"), tx);
        assert_eq!(store.resolve(&key("a"), Err("boom".to_string())), 1);
        assert_eq!(store.get(&key("a")).unwrap().state(), EntryState::Failed);
    }

    #[test]
    fn test_retrying_keeps_waiters() {
        let mut store = Store::new(10);
        let (tx, rx) = mpsc::channel();

        store.mark_pending(&key("a"), 1);
        store.add_waiter(&key("a"), tx);
        store.mark_retrying(&key("a"), "reset by peer".to_string());

        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Failed);
        assert!(entry.retry_scheduled());
        assert!(!entry.is_settled());
        assert!(entry.outcome().is_none());
        assert!(rx.try_recv().is_err());

        store.mark_pending(&key("a"), 1);
        assert_eq!(store.get(&key("a")).unwrap().attempts(), 2);
        store.resolve(&key("a"), Ok("h".to_string()));
        assert_eq!(rx.recv().unwrap(), Ok("h".to_string()));
    }

    #[test]
    fn test_reset_to_empty_fails_waiters() {
        let mut store = Store::new(10);
        let (tx, rx) = mpsc::channel();

        store.reserve(&key("a"));
        store.add_waiter(&key("a"), tx);
        assert_eq!(store.reset_to_empty(&key("a"), "cancelled".to_string()), 1);
        assert_eq!(rx.recv().unwrap(), Err("cancelled".to_string()));
        assert_eq!(store.get(&key("a")).unwrap().state(), EntryState::Empty);
    }

    #[test]
    fn test_abandon_keeps_waiters() {
        let mut store = Store::new(10);
        let (tx, rx) = mpsc::channel();

        store.mark_pending(&key("a"), 1);
        store.add_waiter(&key("a"), tx);
        store.abandon(&key("a"));

        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Empty);
        assert_eq!(entry.attempts(), 0);
        assert_eq!(entry.waiter_count(), 1);
        assert!(rx.try_recv().is_err());

        store.mark_pending(&key("a"), 2);
        store.resolve(&key("a"), Ok("h".to_string()));
        assert_eq!(rx.recv().unwrap(), Ok("h".to_string()));
    }

    #[test]
    fn test_resolve_repairs_unexpected_state() {
        let mut store = Store::new(10);
        store.acquire(&key("a"));

        // Resolving an entry that was never admitted
        store.resolve(&key("a"), Ok("h".to_string()));
        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Ready);
        assert_eq!(entry.ref_count(), 1);
    }

    #[test]
    fn test_mark_pending_repairs_ready_entry() {
        let mut store = Store::new(10);
        store.mark_pending(&key("a"), 1);
        store.resolve(&key("a"), Ok("h".to_string()));

        store.mark_pending(&key("a"), 2);
        let entry = store.get(&key("a")).unwrap();
        assert_eq!(entry.state(), EntryState::Pending);
        assert!(entry.handle().is_none());
        assert_eq!(entry.attempts(), 1);
    }

    #[test]
    fn test_touch_counts_hits() {
        let mut store = Store::new(10);
        assert!(!store.touch(&key("a")));

        store.mark_pending(&key("a"), 1);
        assert!(!store.touch(&key("a")));
        store.resolve(&key("a"), Ok("h".to_string()));
        assert!(store.touch(&key("a")));

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_acquire_release() {
        let mut store = Store::new(10);
        assert_eq!(store.acquire(&key("a")), 1);
        assert_eq!(store.acquire(&key("a")), 2);
        assert_eq!(store.release(&key("a")), 1);
        assert_eq!(store.release(&key("a")), 0);
        assert_eq!(store.release(&key("a")), 0);
        assert_eq!(store.release(&key("unknown")), 0);
    }

    #[test]
    fn test_invalidate_skips_busy_entries() {
        let mut store = Store::new(10);
        store.mark_pending(&key("lot1/a"), 1);
        store.mark_pending(&key("lot1/b"), 1);
        store.resolve(&key("lot1/b"), Err("404".to_string()));
        store.mark_pending(&key("lot2/c"), 1);
        store.resolve(&key("lot2/c"), Ok("h".to_string()));

        let removed = store.invalidate(|k| k.path.starts_with("lot1/"));
        assert_eq!(removed, vec![key("lot1/b")]);
        assert!(store.contains(&key("lot1/a")));
        assert!(store.contains(&key("lot2/c")));
        assert_eq!(store.stats().entries, 2);
    }

    #[test]
    fn test_invalidate_empties_referenced_entries() {
        let mut store = Store::new(10);
        store.acquire(&key("lot1/a"));
        store.mark_pending(&key("lot1/a"), 1);
        store.resolve(&key("lot1/a"), Err("404".to_string()));

        assert_eq!(store.invalidate(|_| true), vec![key("lot1/a")]);
        let entry = store.get(&key("lot1/a")).unwrap();
        assert_eq!(entry.state(), EntryState::Empty);
        assert_eq!(entry.ref_count(), 1);
        assert_eq!(entry.attempts(), 0);
    }

    #[test]
    fn test_queued_entry_is_busy() {
        let mut store = Store::new(10);
        store.mark_enqueued(&key("a"), 2);
        let entry = store.get(&key("a")).unwrap();
        assert!(entry.is_busy());
        assert_eq!(entry.priority(), 2);
        assert!(entry.enqueued_at().is_some());

        store.mark_dequeued(&key("a"));
        assert!(!store.get(&key("a")).unwrap().is_busy());
    }

    #[test]
    fn test_outcome() {
        let mut store = Store::new(10);
        store.mark_pending(&key("a"), 1);
        assert!(store.get(&key("a")).unwrap().outcome().is_none());
        store.resolve(&key("a"), Err("500".to_string()));
        assert_eq!(
            store.get(&key("a")).unwrap().outcome(),
            Some(Err("500".to_string()))
        );
    }
}
