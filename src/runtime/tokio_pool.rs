//! Tokio runtime worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info};

use crate::core::{FlowError, Job, PoolId, PoolStats, Rejected, WorkerPool};
use crate::core::worker_pool::PoolCounters;

/// Worker pool that runs jobs on tokio's blocking thread pool.
///
/// Steps may block (task bodies are synchronous), so jobs go through
/// `spawn_blocking` rather than onto the async workers.
pub struct TokioPool {
    id: PoolId,
    handle: Handle,
    /// Runtime owned by this pool, if it created one.
    runtime: Mutex<Option<Runtime>>,
    worker_count: usize,
    counters: Arc<PoolCounters>,
    shutdown: AtomicBool,
}

impl TokioPool {
    /// Run jobs on an existing runtime.
    pub fn new(id: impl Into<PoolId>, handle: Handle) -> Self {
        Self {
            id: id.into(),
            handle,
            runtime: Mutex::new(None),
            worker_count: 0,
            counters: Arc::new(PoolCounters::default()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Create a pool owning a new multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// `FlowError::Internal` if the runtime cannot be built.
    pub fn with_worker_threads(id: impl Into<PoolId>, worker_threads: usize) -> Result<Self, FlowError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .enable_all()
            .build()
            .map_err(|e| FlowError::Internal(format!("failed to build tokio runtime: {e}")))?;
        let mut pool = Self::new(id, runtime.handle().clone());
        pool.worker_count = worker_threads.max(1);
        *pool.runtime.get_mut() = Some(runtime);
        info!(pool = %pool.id, worker_threads = pool.worker_count, "tokio worker pool initialized");
        Ok(pool)
    }
}

impl WorkerPool for TokioPool {
    fn id(&self) -> &PoolId {
        &self.id
    }

    fn assign(&self, job: Job) -> Result<(), Rejected> {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
            return Err(Rejected {
                error: FlowError::PoolShutdown(self.id.to_string()),
                job,
            });
        }
        self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
        self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::clone(&self.counters);
        self.handle.spawn_blocking(move || {
            counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
            counters.run(job);
        });
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count)
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        debug!(pool = %self.id, "tokio worker pool shut down");
    }
}

impl Drop for TokioPool {
    fn drop(&mut self) {
        // Dropping a runtime inside async context panics; never block here.
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
