//! Loader state
//!
//! Everything the loader mutates lives in one [`LoaderState`] behind the
//! manager's mutex: the cache store, the admission queue, the concurrency
//! counter, the cell registry, scheduled retries and the generation. Methods
//! never block and never call user code. Resolutions that cells must receive
//! are returned as [`Delivery`] values for the caller to dispatch once the
//! lock is released.

use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::source::ThumbnailHandle;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thumbgrid_cache::{CacheStats, CacheStore, EntryState, ThumbnailKey, Waiter};
use thumbgrid_scheduler::{
    AdmissionQueue, CancellationToken, CellId, ConcurrencyLimit, Enqueued, FillPlanner, FillSlot,
    FillStep, Generation, GenerationScope, Tier, VisibilityEvent,
};

/// Final outcome handed to a cell or a ticket
pub type Resolution = Result<ThumbnailHandle, LoadError>;

type Store = CacheStore<ThumbnailHandle, LoadError, Tier>;

/// An admitted fetch, handed to a worker
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub key: ThumbnailKey,
    pub tier: Tier,
    pub generation: Generation,
    pub token: CancellationToken,
}

/// A resolution owed to one registered cell
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub cell: CellId,
    pub resolution: Resolution,
}

/// What [`LoaderState::admit`] did with a request
#[derive(Debug)]
pub(crate) enum Admission {
    /// Settled already; no slot used
    Ready(Resolution),

    /// Joined a fetch that is running or waiting out its retry delay
    Coalesced,

    /// Waiting in the admission queue
    Queued,
}

#[derive(Debug)]
struct CellRecord {
    key: ThumbnailKey,
    order: u64,
    tier: Option<Tier>,
    delivered: bool,
}

#[derive(Debug)]
struct ScheduledRetry {
    key: ThumbnailKey,
    tier: Tier,
    due: Instant,
    generation: Generation,
}

/// Snapshot of loader activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderStats {
    pub cache: CacheStats,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub queued_urgent: usize,
    pub queued_high: usize,
    pub queued_low: usize,
    pub generation: Generation,
    pub registered_cells: usize,
    pub fetches_started: u64,
    pub fetches_failed: u64,
    pub retries_scheduled: u64,
}

impl LoaderStats {
    /// Keys waiting for a slot across all tiers
    pub fn queued(&self) -> usize {
        self.queued_urgent + self.queued_high + self.queued_low
    }
}

#[derive(Debug)]
pub(crate) struct LoaderState {
    store: Store,
    queue: AdmissionQueue<ThumbnailKey>,
    limit: ConcurrencyLimit,
    scope: GenerationScope,
    planner: FillPlanner,
    cells: HashMap<CellId, CellRecord>,
    key_cells: HashMap<ThumbnailKey, Vec<CellId>>,
    next_order: u64,
    retries: Vec<ScheduledRetry>,
    filler_outstanding: HashSet<ThumbnailKey>,
    thumbnail_size: u32,
    retry_delay: Duration,
    cache_timeout: Duration,
    cleanup_interval: Duration,
    last_cleanup: Instant,
    fetches_started: u64,
    fetches_failed: u64,
    retries_scheduled: u64,
}

impl LoaderState {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            store: CacheStore::new(config.max_cache_size),
            queue: AdmissionQueue::new(),
            limit: ConcurrencyLimit::new(config.max_concurrent_loads, config.urgent_cap_boost),
            scope: GenerationScope::new(),
            planner: FillPlanner::new(config.background_batch_size),
            cells: HashMap::new(),
            key_cells: HashMap::new(),
            next_order: 0,
            retries: Vec::new(),
            filler_outstanding: HashSet::new(),
            thumbnail_size: config.thumbnail_size,
            retry_delay: config.retry_delay(),
            cache_timeout: config.cache_timeout(),
            cleanup_interval: config.cleanup_interval(),
            last_cleanup: Instant::now(),
            fetches_started: 0,
            fetches_failed: 0,
            retries_scheduled: 0,
        }
    }

    /// Cache key for `path` at the configured thumbnail size
    pub fn key_for(&self, path: &str) -> ThumbnailKey {
        ThumbnailKey::new(path, self.thumbnail_size)
    }

    pub fn generation(&self) -> Generation {
        self.scope.current()
    }

    pub fn token(&self) -> CancellationToken {
        self.scope.token()
    }

    pub fn is_registered(&self, cell: CellId) -> bool {
        self.cells.contains_key(&cell)
    }

    /// Bind `cell` to `path`. Rebinding a known cell replaces its old binding.
    ///
    /// A cell whose entry is already settled is resolved immediately.
    pub fn register(&mut self, cell: CellId, path: &str) -> Vec<Delivery> {
        self.unregister(cell);

        let key = self.key_for(path);
        self.store.acquire(&key);
        self.store.touch(&key);
        let outcome = self.store.get(&key).and_then(|entry| entry.outcome());

        self.cells.insert(
            cell,
            CellRecord {
                key: key.clone(),
                order: self.next_order,
                tier: None,
                delivered: outcome.is_some(),
            },
        );
        self.next_order += 1;
        self.key_cells.entry(key).or_default().push(cell);
        self.store.trim();

        outcome
            .map(|resolution| vec![Delivery { cell, resolution }])
            .unwrap_or_default()
    }

    /// Forget `cell`. Returns `false` for unknown cells.
    pub fn unregister(&mut self, cell: CellId) -> bool {
        let Some(record) = self.cells.remove(&cell) else {
            return false;
        };
        if let Some(cells) = self.key_cells.get_mut(&record.key) {
            cells.retain(|c| *c != cell);
            if cells.is_empty() {
                self.key_cells.remove(&record.key);
            }
        }
        self.store.release(&record.key);
        if !self.key_cells.contains_key(&record.key) {
            self.withdraw_if_unwanted(&record.key);
        }
        true
    }

    /// Drop a queued key that neither a cell nor a requester wants any more.
    fn withdraw_if_unwanted(&mut self, key: &ThumbnailKey) {
        let Some(entry) = self.store.get(key) else {
            return;
        };
        if entry.waiter_count() > 0 || entry.retry_scheduled() || !self.queue.contains(key) {
            return;
        }
        self.queue.remove(key);
        self.store.mark_dequeued(key);
        self.filler_outstanding.remove(key);
        tracing::debug!(%key, "withdrew queued thumbnail with no remaining cells");
    }

    /// Request `key` at `tier`, optionally attaching a waiter for the result.
    ///
    /// Settled entries answer immediately; pending ones coalesce; anything
    /// else is queued, or promoted if it already waits at a lower tier.
    pub fn admit(
        &mut self,
        key: &ThumbnailKey,
        tier: Tier,
        waiter: Option<Waiter<ThumbnailHandle, LoadError>>,
    ) -> Admission {
        let entry = self.store.reserve(key);
        let outcome = entry.outcome();
        let state = entry.state();
        let retrying = entry.retry_scheduled();

        if let Some(outcome) = outcome {
            self.store.touch(key);
            if let Some(waiter) = waiter {
                // The requester may have given up already
                let _ = waiter.send(outcome.clone());
            }
            return Admission::Ready(outcome);
        }

        if let Some(waiter) = waiter {
            self.store.add_waiter(key, waiter);
        }
        if state == EntryState::Pending {
            return Admission::Coalesced;
        }
        if retrying && !self.queue.contains(key) {
            if let Some(retry) = self.retries.iter_mut().find(|r| &r.key == key) {
                retry.tier = retry.tier.max(tier);
            }
            return Admission::Coalesced;
        }

        match self.queue.push(key.clone(), tier) {
            Enqueued::Inserted => tracing::debug!(%key, ?tier, "queued thumbnail"),
            Enqueued::Promoted(from) => {
                tracing::debug!(%key, ?from, to = ?tier, "promoted queued thumbnail")
            }
            Enqueued::AlreadyQueued(_) => {}
        }
        let queued_at = self.queue.tier_of(key).unwrap_or(tier);
        self.store.mark_enqueued(key, queued_at);
        Admission::Queued
    }

    /// Apply tier changes reported by the visibility oracle.
    ///
    /// Urgent and high cells admit their key. Low cells only demote a key
    /// that is still queued, and only when no other cell bound to the same
    /// key is more visible.
    pub fn apply_visibility(&mut self, events: &[VisibilityEvent]) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for event in events {
            let Some(record) = self.cells.get_mut(&event.cell) else {
                continue;
            };
            record.tier = Some(event.tier);
            if record.delivered {
                continue;
            }
            let key = record.key.clone();

            if event.tier >= Tier::High {
                if let Admission::Ready(resolution) = self.admit(&key, event.tier, None) {
                    deliveries.extend(self.settle_cells(&key, &resolution));
                }
            } else {
                self.demote(&key);
            }
        }
        deliveries
    }

    fn demote(&mut self, key: &ThumbnailKey) {
        let Some(current) = self.queue.tier_of(key) else {
            return;
        };
        if current == Tier::Low {
            return;
        }
        if self.visible_tier(key).is_some_and(|tier| tier > Tier::Low) {
            return;
        }
        if self.store.get(key).is_some_and(|entry| entry.waiter_count() > 0) {
            return;
        }
        self.queue.reprioritize(key, Tier::Low);
        self.store.set_priority(key, Tier::Low);
        tracing::debug!(%key, from = ?current, "demoted queued thumbnail");
    }

    /// Highest reported tier among cells bound to `key`
    fn visible_tier(&self, key: &ThumbnailKey) -> Option<Tier> {
        self.key_cells
            .get(key)?
            .iter()
            .filter_map(|cell| self.cells.get(cell))
            .filter_map(|record| record.tier)
            .max()
    }

    /// Tier at which `key` is still wanted, if anyone still wants it
    fn wanted_tier(&self, key: &ThumbnailKey) -> Option<Tier> {
        let from_cells = self
            .key_cells
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|cell| self.cells.get(cell))
            .filter(|record| !record.delivered)
            .map(|record| record.tier.unwrap_or(Tier::Low))
            .max();
        let from_waiters = self
            .store
            .get(key)
            .filter(|entry| entry.waiter_count() > 0)
            .map(|entry| entry.priority());
        from_cells.max(from_waiters)
    }

    /// Mark every undelivered cell bound to `key` as resolved.
    fn settle_cells(&mut self, key: &ThumbnailKey, resolution: &Resolution) -> Vec<Delivery> {
        let Some(cells) = self.key_cells.get(key) else {
            return Vec::new();
        };
        let mut deliveries = Vec::new();
        for cell in cells {
            if let Some(record) = self.cells.get_mut(cell) {
                if !record.delivered {
                    record.delivered = true;
                    deliveries.push(Delivery {
                        cell: *cell,
                        resolution: resolution.clone(),
                    });
                }
            }
        }
        deliveries
    }

    /// Take a slot for the next admissible key, if any.
    pub fn next_job(&mut self) -> Option<Job> {
        let (key, tier) = self.limit.admit_next(&mut self.queue)?;
        let generation = self.scope.current();
        self.store.mark_pending(&key, generation.value());
        self.fetches_started += 1;
        tracing::debug!(
            %key,
            ?tier,
            in_flight = self.limit.in_flight(),
            "admitted thumbnail fetch"
        );
        Some(Job {
            key,
            tier,
            generation,
            token: self.scope.token(),
        })
    }

    /// Settle a finished fetch and free its slot.
    pub fn complete(&mut self, job: Job, result: Resolution) -> Vec<Delivery> {
        self.limit.release();
        self.filler_outstanding.remove(&job.key);
        let key = job.key;
        let stale = !self.scope.is_current(job.generation);
        if stale {
            tracing::debug!(%key, generation = job.generation.value(), "fetch finished after reset");
        }

        match result {
            Err(LoadError::Cancelled) if stale => {
                self.abandon_fetch(&key);
                Vec::new()
            }
            Err(error) if error.is_retryable() => match self.retry_tier(&key) {
                Some(tier) => {
                    self.schedule_retry(key, tier, error);
                    Vec::new()
                }
                None => self.settle(&key, Err(error)),
            },
            result => self.settle(&key, result),
        }
    }

    fn settle(&mut self, key: &ThumbnailKey, result: Resolution) -> Vec<Delivery> {
        if let Err(error) = &result {
            self.fetches_failed += 1;
            tracing::warn!(%key, %error, "thumbnail failed");
        }
        self.store.resolve(key, result.clone());
        let deliveries = self.settle_cells(key, &result);
        self.store.trim();
        deliveries
    }

    /// A fetch of a superseded generation was aborted: hand it to the
    /// current generation if it still wants the key, otherwise forget it.
    fn abandon_fetch(&mut self, key: &ThumbnailKey) {
        self.store.abandon(key);
        match self.wanted_tier(key) {
            Some(tier) => {
                self.queue.push(key.clone(), tier);
                self.store.mark_enqueued(key, tier);
                tracing::debug!(%key, ?tier, "requeued aborted fetch");
            }
            None => {
                self.store.reset_to_empty(key, LoadError::Cancelled);
            }
        }
    }

    fn retry_tier(&self, key: &ThumbnailKey) -> Option<Tier> {
        let first_attempt = self.store.get(key).is_some_and(|entry| entry.attempts() <= 1);
        if first_attempt {
            self.wanted_tier(key)
        } else {
            None
        }
    }

    fn schedule_retry(&mut self, key: ThumbnailKey, tier: Tier, error: LoadError) {
        tracing::debug!(
            %key,
            %error,
            delay_ms = self.retry_delay.as_millis() as u64,
            "scheduled thumbnail retry"
        );
        self.store.mark_retrying(&key, error);
        self.retries.push(ScheduledRetry {
            key,
            tier,
            due: Instant::now() + self.retry_delay,
            generation: self.scope.current(),
        });
        self.retries_scheduled += 1;
    }

    /// Queue every retry whose delay has elapsed. Returns how many.
    pub fn promote_due_retries(&mut self, now: Instant) -> usize {
        if self.retries.is_empty() {
            return 0;
        }
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retries)
            .into_iter()
            .partition(|retry| retry.due <= now);
        self.retries = waiting;

        let mut promoted = 0;
        for retry in due {
            if !self.scope.is_current(retry.generation) {
                continue;
            }
            self.queue.push(retry.key.clone(), retry.tier);
            self.store.mark_enqueued(&retry.key, retry.tier);
            promoted += 1;
        }
        promoted
    }

    /// Time until the earliest scheduled retry is due
    pub fn next_wake(&self, now: Instant) -> Option<Duration> {
        self.retries
            .iter()
            .map(|retry| retry.due.saturating_duration_since(now))
            .min()
    }

    /// Run the time-triggered cleanup if the cleanup interval has elapsed.
    pub fn maybe_cleanup(&mut self, now: Instant) -> usize {
        if now.saturating_duration_since(self.last_cleanup) < self.cleanup_interval {
            return 0;
        }
        self.cleanup_old_cache(now)
    }

    pub fn cleanup_old_cache(&mut self, now: Instant) -> usize {
        self.last_cleanup = now;
        self.store.cleanup_expired(now, self.cache_timeout)
    }

    pub fn trim(&mut self) -> usize {
        self.store.trim().len()
    }

    /// Replace the working set.
    ///
    /// Queued keys and scheduled retries are dropped and their waiters fail
    /// with [`LoadError::Cancelled`]; every cell binding is released;
    /// permanently failed entries become fetchable again. Running fetches
    /// keep their slot and finish under the old generation.
    pub fn reset(&mut self) -> Generation {
        let previous = self.scope.current();
        let generation = self.scope.advance();
        let dropped = self.drop_queued();

        for (_, record) in self.cells.drain() {
            self.store.release(&record.key);
        }
        self.key_cells.clear();

        let failed: HashSet<ThumbnailKey> =
            self.store.keys_in_state(EntryState::Failed).into_iter().collect();
        self.store.invalidate(|key| failed.contains(key));

        tracing::info!(
            previous = previous.value(),
            generation = generation.value(),
            dropped,
            in_flight = self.limit.in_flight(),
            "reset thumbnail loader"
        );
        generation
    }

    /// Drop every queued key and scheduled retry, failing their waiters
    /// with [`LoadError::Cancelled`]. Returns the number of keys dropped.
    pub fn drop_queued(&mut self) -> usize {
        let mut dropped = self.queue.clear();
        dropped.extend(std::mem::take(&mut self.retries).into_iter().map(|retry| retry.key));
        for key in &dropped {
            self.store.reset_to_empty(key, LoadError::Cancelled);
        }
        self.filler_outstanding.clear();
        dropped.len()
    }

    /// One background fill tick for `generation`.
    ///
    /// Admits up to the batch size of unresolved cells at low priority,
    /// counting fills still queued or running against the batch.
    pub fn fill_tick(&mut self, generation: Generation) -> (FillStep, Vec<Delivery>) {
        if !self.scope.is_current(generation) {
            return (FillStep::Done, Vec::new());
        }

        let mut ordered: Vec<(&CellId, &CellRecord)> = self.cells.iter().collect();
        ordered.sort_by_key(|(_, record)| record.order);

        let slots: Vec<FillSlot> = ordered
            .iter()
            .map(|(cell, record)| FillSlot {
                cell: **cell,
                resolved: record.delivered,
                in_progress: self
                    .store
                    .get(&record.key)
                    .is_some_and(|entry| entry.is_busy()),
            })
            .collect();
        if FillPlanner::is_complete(&slots) {
            return (FillStep::Done, Vec::new());
        }

        let anchor = ordered
            .iter()
            .rposition(|(_, record)| record.tier.is_some_and(|tier| tier >= Tier::High));
        let picks: Vec<ThumbnailKey> = self
            .planner
            .plan(&slots, anchor, self.filler_outstanding.len())
            .into_iter()
            .map(|i| ordered[i].1.key.clone())
            .collect();

        let mut deliveries = Vec::new();
        let mut admitted = 0;
        for key in picks {
            match self.admit(&key, Tier::Low, None) {
                Admission::Ready(resolution) => {
                    deliveries.extend(self.settle_cells(&key, &resolution));
                }
                Admission::Queued => {
                    if self.filler_outstanding.insert(key) {
                        admitted += 1;
                    }
                }
                Admission::Coalesced => {}
            }
        }
        if admitted > 0 {
            tracing::debug!(
                admitted,
                outstanding = self.filler_outstanding.len(),
                "background fill tick"
            );
        }
        (FillStep::Continue, deliveries)
    }

    /// Forget non-busy entries matching `predicate`.
    ///
    /// Cells still bound to an invalidated key count as unresolved again, so
    /// their next visibility event or a filler tick fetches it afresh.
    pub fn invalidate<F>(&mut self, predicate: F) -> Vec<ThumbnailKey>
    where
        F: Fn(&ThumbnailKey) -> bool,
    {
        let invalidated = self.store.invalidate(predicate);
        for key in &invalidated {
            for cell in self.key_cells.get(key).into_iter().flatten() {
                if let Some(record) = self.cells.get_mut(cell) {
                    record.delivered = false;
                }
            }
        }
        if !invalidated.is_empty() {
            tracing::debug!(invalidated = invalidated.len(), "invalidated thumbnails");
        }
        invalidated
    }

    pub fn touch(&mut self, key: &ThumbnailKey) -> bool {
        self.store.touch(key)
    }

    pub fn entry_state(&self, key: &ThumbnailKey) -> Option<EntryState> {
        self.store.get(key).map(|entry| entry.state())
    }

    pub fn cached(&self, key: &ThumbnailKey) -> Option<ThumbnailHandle> {
        self.store.get(key).and_then(|entry| entry.handle().cloned())
    }

    /// Queued keys in admission order
    pub fn queued_keys(&self) -> Vec<ThumbnailKey> {
        Tier::DESCENDING
            .into_iter()
            .flat_map(|tier| self.queue.keys(tier).cloned())
            .collect()
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            cache: self.store.stats(),
            in_flight: self.limit.in_flight(),
            peak_in_flight: self.limit.peak(),
            queued_urgent: self.queue.len_tier(Tier::Urgent),
            queued_high: self.queue.len_tier(Tier::High),
            queued_low: self.queue.len_tier(Tier::Low),
            generation: self.scope.current(),
            registered_cells: self.cells.len(),
            fetches_started: self.fetches_started,
            fetches_failed: self.fetches_failed,
            retries_scheduled: self.retries_scheduled,
        }
    }
}
