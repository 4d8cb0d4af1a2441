//! A pool without workers: jobs run on whichever thread assigns them.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use super::{Job, PoolCounters, PoolId, PoolStats, Rejected, WorkerPool};
use crate::core::error::FlowError;

/// Runs each job synchronously inside [`WorkerPool::assign`].
///
/// Useful for tests and for hosts that want every step on the invoking
/// thread. A thread that resumes a node from outside runs that node's steps
/// itself.
#[derive(Debug)]
pub struct PassivePool {
    id: PoolId,
    counters: PoolCounters,
    shutdown: AtomicBool,
}

impl PassivePool {
    /// Create a passive pool.
    pub fn new(id: impl Into<PoolId>) -> Self {
        Self {
            id: id.into(),
            counters: PoolCounters::default(),
            shutdown: AtomicBool::new(false),
        }
    }
}

impl WorkerPool for PassivePool {
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
        trace!(pool = %self.id, node = %job.node(), "running job inline");
        self.counters.run(job);
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        self.counters.snapshot(0)
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
