//! Native worker pool using dedicated OS threads.
//!
//! Workers block on a bounded channel; dropping the sender unblocks them at
//! shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{Job, PoolCounters, PoolId, PoolStats, Rejected, WorkerPool};
use crate::config::PoolConfig;
use crate::core::error::FlowError;

/// Worker pool with dedicated OS threads.
pub struct ThreadedPool {
    id: PoolId,
    worker_count: usize,
    /// Job sender. `None` once shut down.
    job_tx: Mutex<Option<Sender<Job>>>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedPool {
    /// Create a pool and spawn `config.worker_count` threads.
    ///
    /// # Errors
    ///
    /// `FlowError::InvalidConfig` for an invalid configuration and
    /// `FlowError::Internal` if a worker thread cannot be spawned.
    pub fn new(id: impl Into<PoolId>, config: &PoolConfig) -> Result<Self, FlowError> {
        config.validate().map_err(FlowError::InvalidConfig)?;
        let id = id.into();

        let (job_tx, job_rx) = bounded::<Job>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let worker = spawn_worker(
                &id,
                worker_id,
                job_rx.clone(),
                Arc::clone(&counters),
                Arc::clone(&shutdown),
                config.thread_stack_size,
            )
            .map_err(|e| FlowError::Internal(format!("failed to spawn worker thread: {e}")))?;
            workers.push(worker);
        }

        info!(
            pool = %id,
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            "threaded worker pool initialized"
        );

        Ok(Self {
            id,
            worker_count: config.worker_count,
            job_tx: Mutex::new(Some(job_tx)),
            counters,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    fn reject(&self, error: FlowError, job: Job) -> Result<(), Rejected> {
        self.counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
        Err(Rejected { error, job })
    }
}

impl WorkerPool for ThreadedPool {
    fn id(&self) -> &PoolId {
        &self.id
    }

    fn assign(&self, job: Job) -> Result<(), Rejected> {
        if self.shutdown.load(Ordering::Acquire) {
            return self.reject(FlowError::PoolShutdown(self.id.to_string()), job);
        }
        let job_tx = self.job_tx.lock();
        let Some(job_tx) = job_tx.as_ref() else {
            return self.reject(FlowError::PoolShutdown(self.id.to_string()), job);
        };
        // Counted before the send so a fast worker never decrements first.
        self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
        match job_tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                warn!(pool = %self.id, "worker pool queue is full");
                self.reject(FlowError::QueueFull(self.id.to_string()), job)
            }
            Err(TrySendError::Disconnected(job)) => {
                self.counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                self.reject(FlowError::PoolShutdown(self.id.to_string()), job)
            }
        }
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }

    /// Drops the sender, then joins each worker with a 2 second timeout.
    /// Jobs still queued are drained by the workers before they exit.
    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %self.id, "shutting down worker pool");
        self.job_tx.lock().take();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let worker_count = workers.len();
        let current = thread::current().id();
        for (idx, worker) in workers.into_iter().enumerate() {
            if worker.thread().id() == current {
                debug!(pool = %self.id, worker_id = idx, "shutdown called from a worker, detaching it");
                continue;
            }
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(true) => debug!(pool = %self.id, worker_id = idx, "worker joined"),
                Ok(false) => warn!(pool = %self.id, worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(pool = %self.id, worker_id = idx, "worker did not exit within timeout, detaching");
                    continue;
                }
            }
            let _ = join_thread.join();
        }
        info!(pool = %self.id, worker_count, "worker pool shut down");
    }
}

impl Drop for ThreadedPool {
    fn drop(&mut self) {
        // Signal only; joining here can hang on a worker that is mid-job.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.job_tx.lock().take();
            debug!(pool = %self.id, "worker pool dropped without explicit shutdown, workers detached");
        }
    }
}

fn spawn_worker(
    pool: &PoolId,
    worker_id: usize,
    job_rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    let pool = pool.clone();
    thread::Builder::new()
        .name(format!("flow-{pool}-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(pool = %pool, worker_id, "worker thread started");
            // recv fails once the sender is dropped and the queue is empty.
            while let Ok(job) = job_rx.recv() {
                counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
                if shutdown.load(Ordering::Acquire) {
                    debug!(pool = %pool, worker_id, node = %job.node(), "running job queued before shutdown");
                }
                counters.run(job);
            }
            debug!(pool = %pool, worker_id, "worker thread exiting");
        })
}
