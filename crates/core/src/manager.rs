//! Thumbnail manager
//!
//! [`ThumbnailManager`] is the one object a grid host talks to. It owns the
//! cache, the admission queue, the visibility oracle, the fetch workers and
//! the background filler, and exposes the cell-binding interface:
//! - [`register`](ThumbnailManager::register) and
//!   [`unregister`](ThumbnailManager::unregister) as cells mount and unmount
//! - [`pump_visibility`](ThumbnailManager::pump_visibility) whenever the
//!   viewport moves
//! - [`cancel_pending_requests`](ThumbnailManager::cancel_pending_requests)
//!   when the displayed collection is replaced
//!
//! Resolutions reach the host through the callback given at construction.
//! The callback runs on loader threads (or on the thread that called into the
//! manager) while deliveries are serialized, so it must not call back into
//! the manager. Hand the result to the UI thread instead.

use crate::config::LoaderConfig;
use crate::error::{LoadError, LoaderError};
use crate::source::{HttpThumbnailSource, ThumbnailHandle, ThumbnailSource};
use crate::state::{Delivery, Job, LoaderState, LoaderStats, Resolution};
use crate::worker::WorkerPool;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError, TryRecvError},
    Arc, Condvar, Mutex, MutexGuard, PoisonError,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thumbgrid_cache::{EntryState, ThumbnailKey};
use thumbgrid_scheduler::{
    CancellationToken, CellId, FillStep, Generation, Tier, VisibilityOracle,
};

type ResolveCallback = dyn Fn(CellId, &Resolution) + Send + Sync;

/// State shared between the manager, its workers and the filler thread.
pub(crate) struct Shared {
    state: Mutex<LoaderState>,
    wake: Condvar,
    dispatch: Mutex<()>,
    shutdown: AtomicBool,
    pub(crate) source: Arc<dyn ThumbnailSource>,
    on_resolved: Box<ResolveCallback>,
    oracle: Mutex<Box<dyn VisibilityOracle>>,
    config: LoaderConfig,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_oracle(&self) -> MutexGuard<'_, Box<dyn VisibilityOracle>> {
        self.oracle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes deliveries against registry changes, so a cell never hears
    /// about a resolution after `unregister` or a reset returned.
    fn lock_dispatch(&self) -> MutexGuard<'_, ()> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    /// Must be called with the dispatch lock held.
    fn dispatch(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            (self.on_resolved)(delivery.cell, &delivery.resolution);
        }
    }

    /// Block until a job is admitted or the loader shuts down.
    ///
    /// Due retries are promoted and the periodic cache cleanup runs here,
    /// so an idle loader still maintains itself.
    pub(crate) fn wait_for_job(&self) -> Option<Job> {
        let poll_interval = self.config.poll_interval().max(Duration::from_millis(1));
        let mut state = self.lock_state();
        loop {
            if self.is_shutting_down() {
                return None;
            }

            let now = Instant::now();
            if state.promote_due_retries(now) > 0 {
                self.wake.notify_all();
            }
            state.maybe_cleanup(now);
            if let Some(job) = state.next_job() {
                return Some(job);
            }

            let wait = state
                .next_wake(now)
                .map_or(poll_interval, |due| due.min(poll_interval));
            state = self
                .wake
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Hand a fetch result back, free its slot and notify cells.
    pub(crate) fn finish(&self, job: Job, result: Resolution) {
        let _dispatch = self.lock_dispatch();
        let deliveries = self.lock_state().complete(job, result);
        self.wake.notify_all();
        self.dispatch(deliveries);
    }

    fn fill_step(&self, generation: Generation) -> FillStep {
        let _dispatch = self.lock_dispatch();
        let (step, deliveries) = self.lock_state().fill_tick(generation);
        self.wake.notify_all();
        self.dispatch(deliveries);
        step
    }
}

fn run_filler(shared: Arc<Shared>, generation: Generation, token: CancellationToken) {
    tracing::debug!(generation = generation.value(), "background fill started");
    let interval = shared.config.frame_interval();
    while !shared.is_shutting_down() && !token.is_cancelled() {
        if shared.fill_step(generation) == FillStep::Done {
            break;
        }
        thread::sleep(interval);
    }
    tracing::debug!(generation = generation.value(), "background fill stopped");
}

/// Pending result of [`ThumbnailManager::admit`].
///
/// Every ticket for the same key shares one underlying fetch.
#[derive(Debug)]
pub struct Ticket {
    rx: Receiver<Resolution>,
}

impl Ticket {
    /// Block until the thumbnail settles.
    ///
    /// A request dropped by a reset, or outliving its manager, resolves to
    /// [`LoadError::Cancelled`].
    pub fn wait(self) -> Resolution {
        self.rx.recv().unwrap_or(Err(LoadError::Cancelled))
    }

    /// Wait up to `timeout`; `None` if the thumbnail has not settled yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Resolution> {
        match self.rx.recv_timeout(timeout) {
            Ok(resolution) => Some(resolution),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(LoadError::Cancelled)),
        }
    }

    /// Non-blocking check
    pub fn try_result(&self) -> Option<Resolution> {
        match self.rx.try_recv() {
            Ok(resolution) => Some(resolution),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(LoadError::Cancelled)),
        }
    }
}

/// Viewport-aware, bounded-concurrency thumbnail loader.
///
/// # Example
///
/// ```no_run
/// use thumbgrid_core::{CellId, LayoutOracle, LoaderConfig, Rect, ThumbnailManager, Viewport};
///
/// let oracle = LayoutOracle::new(200.0);
/// let manager = ThumbnailManager::with_http(LoaderConfig::default(), oracle.clone(), |cell, result| {
///     println!("{cell}: {}", result.is_ok());
/// })?;
///
/// oracle.set_viewport(Viewport::new(0.0, 0.0, 1280.0, 800.0));
/// for (i, path) in ["lot1/wafer_001.png", "lot1/wafer_002.png"].iter().enumerate() {
///     oracle.place(CellId(i as u64), Rect::new(i as f32 * 160.0, 0.0, 160.0, 160.0));
///     manager.register(CellId(i as u64), path);
/// }
/// manager.pump_visibility();
/// manager.start_background_fill()?;
///
/// // Folder switch
/// manager.cancel_pending_requests();
/// # Ok::<(), thumbgrid_core::LoaderError>(())
/// ```
pub struct ThumbnailManager {
    shared: Arc<Shared>,
    workers: Mutex<Option<WorkerPool>>,
    filler: Mutex<Option<JoinHandle<()>>>,
}

impl ThumbnailManager {
    /// Create a manager and start its fetch workers.
    ///
    /// # Errors
    /// Fails if the configuration is invalid or a worker thread cannot be
    /// spawned.
    pub fn new<S, O, F>(
        config: LoaderConfig,
        source: S,
        oracle: O,
        on_resolved: F,
    ) -> Result<Self, LoaderError>
    where
        S: ThumbnailSource + 'static,
        O: VisibilityOracle + 'static,
        F: Fn(CellId, &Resolution) + Send + Sync + 'static,
    {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(LoaderState::new(&config)),
            wake: Condvar::new(),
            dispatch: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            source: Arc::new(source),
            on_resolved: Box::new(on_resolved),
            oracle: Mutex::new(Box::new(oracle) as Box<dyn VisibilityOracle>),
            config,
        });
        let workers = WorkerPool::new(&shared, shared.config.worker_count())?;

        Ok(Self {
            shared,
            workers: Mutex::new(Some(workers)),
            filler: Mutex::new(None),
        })
    }

    /// Create a manager fetching from `config.server_url` over HTTP.
    pub fn with_http<O, F>(config: LoaderConfig, oracle: O, on_resolved: F) -> Result<Self, LoaderError>
    where
        O: VisibilityOracle + 'static,
        F: Fn(CellId, &Resolution) + Send + Sync + 'static,
    {
        let source = HttpThumbnailSource::from_config(&config);
        Self::new(config, source, oracle, on_resolved)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    /// Number of fetch worker threads
    pub fn worker_count(&self) -> usize {
        self.lock_workers().as_ref().map_or(0, WorkerPool::num_workers)
    }

    fn key(&self, path: &str) -> ThumbnailKey {
        ThumbnailKey::new(path, self.shared.config.thumbnail_size)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Option<WorkerPool>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_filler(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.filler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin tracking `cell`, which displays the image at `path`.
    ///
    /// Registration order is the grid order used by the background filler.
    /// If the thumbnail is already settled the callback fires before this
    /// returns.
    pub fn register(&self, cell: CellId, path: &str) {
        let rebound = {
            let _dispatch = self.shared.lock_dispatch();
            let mut state = self.shared.lock_state();
            let rebound = state.is_registered(cell);
            let deliveries = state.register(cell, path);
            drop(state);
            self.shared.dispatch(deliveries);
            rebound
        };

        let mut oracle = self.shared.lock_oracle();
        if rebound {
            // Report the cell's tier afresh for its new key
            oracle.unobserve(cell);
        }
        oracle.observe(cell);
    }

    /// Stop tracking `cell`. No callback for it fires after this returns.
    ///
    /// Returns `false` if the cell was not registered.
    pub fn unregister(&self, cell: CellId) -> bool {
        let removed = {
            let _dispatch = self.shared.lock_dispatch();
            self.shared.lock_state().unregister(cell)
        };
        self.shared.lock_oracle().unobserve(cell);
        removed
    }

    pub fn is_registered(&self, cell: CellId) -> bool {
        self.shared.lock_state().is_registered(cell)
    }

    /// Drain visibility changes from the oracle and act on them.
    ///
    /// Returns the number of events processed.
    pub fn pump_visibility(&self) -> usize {
        let events = self.shared.lock_oracle().poll_events();
        if events.is_empty() {
            return 0;
        }

        let _dispatch = self.shared.lock_dispatch();
        let deliveries = self.shared.lock_state().apply_visibility(&events);
        self.shared.wake.notify_all();
        self.shared.dispatch(deliveries);
        events.len()
    }

    /// Request the thumbnail for `path` at `tier`.
    ///
    /// Cached results complete the ticket immediately without using a slot;
    /// concurrent requests for one key share a single fetch.
    pub fn admit(&self, path: &str, tier: Tier) -> Ticket {
        let key = self.key(path);
        self.admit_key(&key, tier)
    }

    /// [`admit`](Self::admit) for an explicit key, e.g. another size
    pub fn admit_key(&self, key: &ThumbnailKey, tier: Tier) -> Ticket {
        let (tx, rx) = mpsc::channel();
        {
            let mut state = self.shared.lock_state();
            if self.shared.is_shutting_down() {
                // `rx` is alive, so the send cannot fail
                let _ = tx.send(Err(LoadError::Cancelled));
                return Ticket { rx };
            }
            state.admit(key, tier, Some(tx));
        }
        self.shared.wake.notify_all();
        Ticket { rx }
    }

    /// Pure lookup of the entry state for `path`
    pub fn entry_state(&self, path: &str) -> Option<EntryState> {
        self.shared.lock_state().entry_state(&self.key(path))
    }

    /// Cached handle for `path`, if it is ready
    pub fn cached(&self, path: &str) -> Option<ThumbnailHandle> {
        self.shared.lock_state().cached(&self.key(path))
    }

    /// Mark a displayed thumbnail as recently used.
    pub fn touch(&self, path: &str) -> bool {
        self.shared.lock_state().touch(&self.key(path))
    }

    /// Run one background fill tick on the calling thread.
    ///
    /// Hosts with their own frame loop can call this instead of
    /// [`start_background_fill`](Self::start_background_fill).
    pub fn fill_step(&self) -> FillStep {
        let generation = self.shared.lock_state().generation();
        self.shared.fill_step(generation)
    }

    /// Start the background filler thread for the current generation.
    ///
    /// The filler ticks once per frame interval and stops once every
    /// registered cell is resolved, on reset, or on shutdown; call this after
    /// registering the grid's cells. Returns `false` if a filler is already
    /// running.
    pub fn start_background_fill(&self) -> Result<bool, LoaderError> {
        let mut filler = self.lock_filler();
        if filler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }

        let (generation, token) = {
            let state = self.shared.lock_state();
            (state.generation(), state.token())
        };
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("thumbgrid-filler".to_string())
            .spawn(move || run_filler(shared, generation, token))
            .map_err(|source| LoaderError::Spawn {
                name: "background filler",
                source,
            })?;
        *filler = Some(handle);
        Ok(true)
    }

    pub fn is_background_fill_running(&self) -> bool {
        self.lock_filler()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Replace the working set.
    ///
    /// Empties the admission queues, disconnects the oracle and stops the
    /// background filler. Fetches already running are left to finish; their
    /// results are cached but reach only cells registered afterwards for the
    /// same key. Returns the new generation.
    pub fn cancel_pending_requests(&self) -> Generation {
        let generation = {
            let _dispatch = self.shared.lock_dispatch();
            self.shared.lock_state().reset()
        };
        self.shared.lock_oracle().disconnect();

        // The detached filler sees its cancelled token on its next tick
        self.lock_filler().take();
        self.shared.wake.notify_all();
        generation
    }

    pub fn generation(&self) -> Generation {
        self.shared.lock_state().generation()
    }

    /// Trim the cache back toward its cap. Returns the number evicted.
    pub fn trim(&self) -> usize {
        self.shared.lock_state().trim()
    }

    /// Remove idle, undisplayed entries older than the cache timeout.
    pub fn cleanup_old_cache(&self) -> usize {
        self.cleanup_old_cache_at(Instant::now())
    }

    /// [`cleanup_old_cache`](Self::cleanup_old_cache) as of `now`
    pub fn cleanup_old_cache_at(&self, now: Instant) -> usize {
        self.shared.lock_state().cleanup_old_cache(now)
    }

    /// Forget the cached thumbnail for `path` so it can be fetched again.
    ///
    /// Entries with a fetch running or queued are left alone.
    pub fn invalidate(&self, path: &str) -> bool {
        let key = self.key(path);
        !self.shared.lock_state().invalidate(|k| *k == key).is_empty()
    }

    /// Forget every cached thumbnail under `prefix`, e.g. on folder reload.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.shared
            .lock_state()
            .invalidate(|k| k.path.starts_with(prefix))
            .len()
    }

    /// Forget every cached thumbnail that no fetch depends on.
    pub fn clear_cache(&self) -> usize {
        self.shared.lock_state().invalidate(|_| true).len()
    }

    /// Send a best-effort preload hint for `paths` on a detached thread.
    ///
    /// Failures are logged and otherwise ignored; per-key fetching does not
    /// depend on the hint.
    pub fn preload(&self, paths: Vec<String>) -> Result<(), LoaderError> {
        if paths.is_empty() {
            return Ok(());
        }

        let source = self.shared.source.clone();
        let size = self.shared.config.thumbnail_size;
        thread::Builder::new()
            .name("thumbgrid-preload".to_string())
            .spawn(move || match source.preload(&paths, size) {
                Ok(()) => tracing::debug!(paths = paths.len(), "preload hint sent"),
                Err(error) => tracing::debug!(%error, "preload hint failed"),
            })
            .map_err(|source| LoaderError::Spawn {
                name: "preload",
                source,
            })?;
        Ok(())
    }

    /// Keys waiting for a slot, in admission order
    pub fn queued_keys(&self) -> Vec<ThumbnailKey> {
        self.shared.lock_state().queued_keys()
    }

    pub fn stats(&self) -> LoaderStats {
        self.shared.lock_state().stats()
    }

    /// Stop the workers and the filler and wait for them.
    ///
    /// Running fetches are signalled through their cancellation token and
    /// finish before this returns. Tickets still queued, and any requested
    /// afterwards, resolve to [`LoadError::Cancelled`]. Idempotent.
    pub fn shutdown(&self) {
        let Some(workers) = self.lock_workers().take() else {
            return;
        };

        {
            let state = self.shared.lock_state();
            state.token().cancel();
            self.shared.begin_shutdown();
        }
        workers.shutdown();

        if let Some(filler) = self.lock_filler().take() {
            if filler.join().is_err() {
                tracing::warn!("background filler panicked");
            }
        }

        let dropped = self.shared.lock_state().drop_queued();
        if dropped > 0 {
            tracing::debug!(dropped, "cancelled queued thumbnails on shutdown");
        }
    }
}

impl Drop for ThumbnailManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
