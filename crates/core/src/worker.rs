//! Fetch worker pool
//!
//! A fixed set of named threads performs admitted fetches. Workers sleep on
//! the loader's condvar and wake when a key is queued, a slot frees or a
//! retry falls due. The poll interval bounds every sleep so that shutdown
//! and scheduled retries are noticed without an explicit wake-up.

use crate::error::{LoadError, LoaderError};
use crate::manager::Shared;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Fixed pool of fetch threads.
///
/// The pool is sized to the base concurrency cap plus the urgent boost, so
/// a worker is always available when the admission rule grants a slot.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn `num_workers` threads serving `shared`.
    ///
    /// If a spawn fails, the threads already started are stopped and joined.
    pub fn new(shared: &Arc<Shared>, num_workers: usize) -> Result<Self, LoaderError> {
        let mut workers = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            match Worker::new(id, shared.clone()) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    shared.begin_shutdown();
                    for worker in workers {
                        worker.join();
                    }
                    return Err(err);
                }
            }
        }

        tracing::info!(workers = num_workers, "started thumbnail fetch workers");
        Ok(Self { workers })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit.
    ///
    /// The caller signals shutdown first; workers finish their current
    /// fetch before exiting.
    pub fn shutdown(self) {
        let count = self.workers.len();
        for worker in self.workers {
            worker.join();
        }
        tracing::info!(workers = count, "stopped thumbnail fetch workers");
    }
}

/// A single worker thread in the pool.
struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, shared: Arc<Shared>) -> Result<Self, LoaderError> {
        let thread = thread::Builder::new()
            .name(format!("thumbgrid-fetch-{id}"))
            .spawn(move || Self::run(&shared))
            .map_err(|source| LoaderError::Spawn {
                name: "fetch worker",
                source,
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    /// Main worker loop.
    ///
    /// Pull the next admitted job, fetch it outside the state lock, then
    /// hand the result back. A job whose generation was cancelled before
    /// the fetch started is not fetched at all. A panicking source fails
    /// the job instead of taking the worker and its slot down with it.
    fn run(shared: &Shared) {
        while let Some(job) = shared.wait_for_job() {
            let result = if job.token.is_cancelled() {
                Err(LoadError::Cancelled)
            } else {
                tracing::trace!(key = %job.key, tier = ?job.tier, "fetching thumbnail");
                panic::catch_unwind(AssertUnwindSafe(|| {
                    shared.source.fetch(&job.key, &job.token)
                }))
                .unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(key = %job.key, %message, "thumbnail source panicked");
                    Err(LoadError::InvalidResponse(format!("source panicked: {message}")))
                })
                .map(Arc::new)
            };
            shared.finish(job, result);
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(worker = self.id, "fetch worker panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
