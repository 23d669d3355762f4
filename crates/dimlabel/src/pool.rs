//! Fixed-size worker pool fed by a [`SyncQueue`].

use crate::config::PoolConfig;
use crate::error::{DimLabelError, Result};
use crate::queue::SyncQueue;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A unit of work executed on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads that pop [`Job`]s until their queue is drained.
///
/// Jobs are expected to report their own results (for example through a
/// second `SyncQueue`); the pool only runs them.
pub struct WorkerPool {
    queue: Arc<SyncQueue<Job>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns the configured number of worker threads.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero thread count, or an I/O error
    /// if a thread cannot be spawned.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.threads == 0 {
            return Err(DimLabelError::InvalidArgument(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let queue: Arc<SyncQueue<Job>> = Arc::new(SyncQueue::new());
        let mut workers = Vec::with_capacity(config.threads);
        for id in 0..config.threads {
            let worker_queue = Arc::clone(&queue);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, id))
                .spawn(move || Self::run_worker(id, &worker_queue));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    stop_workers(&queue, workers);
                    return Err(e.into());
                }
            }
        }

        debug!("Started worker pool with {} threads", config.threads);
        Ok(Self {
            queue,
            workers: Mutex::new(workers),
            size: config.threads,
        })
    }

    fn run_worker(id: usize, queue: &SyncQueue<Job>) {
        while let Some(job) = queue.pop() {
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("Job panicked on worker {}", id);
            }
        }
        debug!("Worker {} exiting", id);
    }

    /// Queues a job for execution.
    ///
    /// # Errors
    ///
    /// Returns `PoolShutdown` once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.queue.push(Box::new(job)) {
            Ok(())
        } else {
            Err(DimLabelError::PoolShutdown)
        }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns false once [`shutdown`](Self::shutdown) has been called.
    pub fn is_running(&self) -> bool {
        self.queue.is_open()
    }

    /// Stops accepting jobs, lets workers finish queued ones, and joins them.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let workers = {
            let mut guard = self.workers.lock().unwrap_or_else(|err| err.into_inner());
            std::mem::take(&mut *guard)
        };
        stop_workers(&self.queue, workers);
    }
}

/// Drains `queue` so idle workers exit, then joins them.
fn stop_workers(queue: &SyncQueue<Job>, workers: Vec<JoinHandle<()>>) {
    queue.drain();
    for handle in workers {
        if handle.join().is_err() {
            warn!("Worker thread panicked during shutdown");
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
