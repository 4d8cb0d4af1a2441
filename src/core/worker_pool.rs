//! Worker pools that run logical-thread steps.
//!
//! A pool never runs task bodies directly. It receives [`Job`]s: "drain the
//! ready queue of this logical thread, starting from this node". Three
//! implementations are provided:
//!
//! - [`ThreadedPool`]: dedicated OS threads pulling jobs from a bounded channel.
//! - [`PassivePool`]: runs each job synchronously inside `assign`.
//! - `TokioPool` (feature `tokio-runtime`): hands jobs to a tokio runtime.
//!
//! Pools are registered in a [`PoolRegistry`] that resolves a node's
//! [`Responsibility`] to the pool that must run it.

#[cfg(not(target_arch = "wasm32"))]
mod threaded;
mod passive;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::definition::Responsibility;
use super::error::FlowError;
use super::node::NodeId;
use super::thread::LogicalThread;

pub use passive::PassivePool;
#[cfg(not(target_arch = "wasm32"))]
pub use threaded::ThreadedPool;

/// Name of a registered worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    /// Create a pool id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The pool name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PoolId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Unit of work handed to a pool: run the ready steps of one logical thread.
pub struct Job {
    thread: Arc<LogicalThread>,
    node: NodeId,
    pool: PoolId,
}

impl Job {
    pub(crate) const fn new(thread: Arc<LogicalThread>, node: NodeId, pool: PoolId) -> Self {
        Self { thread, node, pool }
    }

    /// The pool this job was assigned to.
    #[must_use]
    pub const fn pool(&self) -> &PoolId {
        &self.pool
    }

    /// The node whose activation created this job.
    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    /// Run the job on the current OS thread.
    ///
    /// Follow-up activations that stay on the same pool are processed here,
    /// breadth-first, without another hand-off.
    pub fn run(self) {
        let mut queue = VecDeque::new();
        queue.push_back(self);
        while let Some(job) = queue.pop_front() {
            job.thread.drain(&job.pool, job.node, &mut queue);
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("thread", &self.thread.id())
            .field("node", &self.node)
            .field("pool", &self.pool)
            .finish()
    }
}

/// A job a pool refused, handed back so the caller can run it.
#[derive(Debug)]
pub struct Rejected {
    /// Why the pool refused.
    pub error: FlowError,
    /// The refused job.
    pub job: Job,
}

/// An executor of [`Job`]s.
pub trait WorkerPool: Send + Sync {
    /// Name under which the pool is registered.
    fn id(&self) -> &PoolId;

    /// Accept `job` for execution.
    ///
    /// # Errors
    ///
    /// Returns the job back when the pool is shut down or its queue is full.
    fn assign(&self, job: Job) -> Result<(), Rejected>;

    /// Current statistics.
    fn stats(&self) -> PoolStats;

    /// Stop accepting jobs and release workers.
    fn shutdown(&self);
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of worker threads (zero for a passive pool).
    pub worker_count: usize,
    /// Jobs currently running.
    pub active_jobs: u64,
    /// Jobs waiting in the queue.
    pub queued_jobs: u64,
    /// Jobs finished.
    pub completed_jobs: u64,
    /// Jobs accepted.
    pub submitted_jobs: u64,
    /// Jobs refused (full queue or shut down).
    pub rejected_jobs: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_jobs: AtomicU64,
    pub queued_jobs: AtomicU64,
    pub completed_jobs: AtomicU64,
    pub submitted_jobs: AtomicU64,
    pub rejected_jobs: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            submitted_jobs: self.submitted_jobs.load(Ordering::Relaxed),
            rejected_jobs: self.rejected_jobs.load(Ordering::Relaxed),
        }
    }

    /// Run `job` while keeping `active`/`completed` in step.
    pub fn run(&self, job: Job) {
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
        job.run();
        self.active_jobs.fetch_sub(1, Ordering::Relaxed);
        self.completed_jobs.fetch_add(1, Ordering::Relaxed);
    }
}

/// Registered pools plus the default pool.
pub struct PoolRegistry {
    pools: HashMap<PoolId, Arc<dyn WorkerPool>>,
    default: PoolId,
}

impl PoolRegistry {
    /// Create a registry whose default pool is `default`.
    pub fn new(default: Arc<dyn WorkerPool>) -> Self {
        let id = default.id().clone();
        let mut pools = HashMap::new();
        pools.insert(id.clone(), default);
        Self { pools, default: id }
    }

    /// Register another pool, replacing any pool with the same id.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<dyn WorkerPool>) -> Self {
        self.register(pool);
        self
    }

    /// Register another pool, replacing any pool with the same id.
    pub fn register(&mut self, pool: Arc<dyn WorkerPool>) {
        if let Some(previous) = self.pools.insert(pool.id().clone(), pool) {
            warn!(pool = %previous.id(), "worker pool replaced");
        }
    }

    /// The default pool's id.
    #[must_use]
    pub const fn default_pool(&self) -> &PoolId {
        &self.default
    }

    /// Look a pool up by id.
    #[must_use]
    pub fn get(&self, id: &PoolId) -> Option<&Arc<dyn WorkerPool>> {
        self.pools.get(id)
    }

    /// Registered pool ids.
    pub fn ids(&self) -> impl Iterator<Item = &PoolId> {
        self.pools.keys()
    }

    /// The pool responsible for a node, seen from `calling`.
    pub(crate) fn target(&self, responsibility: &Responsibility, calling: Option<&PoolId>) -> PoolId {
        match responsibility {
            Responsibility::Any => calling
                .filter(|id| self.pools.contains_key(*id))
                .unwrap_or(&self.default)
                .clone(),
            Responsibility::Pool(name) => {
                let id = PoolId::new(name.as_str());
                if self.pools.contains_key(&id) {
                    id
                } else {
                    warn!(pool = %name, "unknown worker pool, using the default pool");
                    self.default.clone()
                }
            }
            Responsibility::Decoupled => self.default.clone(),
        }
    }

    /// Hand `job` to the pool it names.
    pub(crate) fn assign(&self, job: Job) -> Result<(), Rejected> {
        match self.pools.get(job.pool()) {
            Some(pool) => {
                debug!(pool = %job.pool(), node = %job.node(), "job assigned");
                pool.assign(job)
            }
            None => Err(Rejected {
                error: FlowError::UnknownPool(job.pool().to_string()),
                job,
            }),
        }
    }

    /// Statistics per pool.
    #[must_use]
    pub fn stats(&self) -> HashMap<PoolId, PoolStats> {
        self.pools
            .iter()
            .map(|(id, pool)| (id.clone(), pool.stats()))
            .collect()
    }

    /// Shut every pool down.
    pub fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown();
        }
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&PoolId> = self.pools.keys().collect();
        ids.sort();
        f.debug_struct("PoolRegistry")
            .field("pools", &ids)
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PoolRegistry {
        PoolRegistry::new(Arc::new(PassivePool::new("main")))
            .with_pool(Arc::new(PassivePool::new("gpu")))
    }

    #[test]
    fn test_any_follows_calling_pool() {
        let pools = registry();
        let gpu = PoolId::new("gpu");
        assert_eq!(pools.target(&Responsibility::Any, Some(&gpu)), gpu);
        assert_eq!(pools.target(&Responsibility::Any, None), PoolId::new("main"));
        assert_eq!(
            pools.target(&Responsibility::Any, Some(&PoolId::new("gone"))),
            PoolId::new("main")
        );
    }

    #[test]
    fn test_named_and_decoupled_targets() {
        let pools = registry();
        let gpu = PoolId::new("gpu");
        assert_eq!(pools.target(&Responsibility::Pool("gpu".into()), None), gpu);
        assert_eq!(
            pools.target(&Responsibility::Pool("missing".into()), Some(&gpu)),
            PoolId::new("main")
        );
        assert_eq!(pools.target(&Responsibility::Decoupled, Some(&gpu)), PoolId::new("main"));
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = PoolCounters::default();
        counters.submitted_jobs.fetch_add(2, Ordering::Relaxed);
        counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
        let stats = counters.snapshot(4);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.submitted_jobs, 2);
        assert_eq!(stats.rejected_jobs, 1);
    }
}
