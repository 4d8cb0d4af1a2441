//! The scheduler: pools, fallbacks and audit shared by every process.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use super::audit::{AuditSink, NullAuditSink};
use super::error::FlowError;
use super::escalation::EscalationProcedure;
use super::node::NodeSeed;
use super::process::{Invocation, Process, ProcessDefinition, ProcessHandle, ProcessId};
use super::stats::{FlowCounters, FlowStats};
use super::worker_pool::{PassivePool, PoolId, PoolRegistry, PoolStats, WorkerPool};
use crate::builders::build_pools;
use crate::config::{SchedulerConfig, DEFAULT_POOL_NAME};

/// State shared by the scheduler and every process it invoked.
pub(crate) struct SchedulerCore {
    pub pools: PoolRegistry,
    pub counters: FlowCounters,
    pub audit: Arc<dyn AuditSink>,
    pub top_level: Option<Arc<EscalationProcedure>>,
    next_process: AtomicU64,
}

/// Entry point: invokes processes and owns the worker pools.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Start building a scheduler.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Build a scheduler whose pools come from `cfg`.
    ///
    /// # Errors
    ///
    /// Any configuration or pool construction error.
    pub fn from_config(cfg: &SchedulerConfig) -> Result<Self, FlowError> {
        Ok(Self::builder().pools(build_pools(cfg)?).build())
    }

    /// Start a process. The entry task becomes the root node of the main
    /// logical thread and is activated on the default pool.
    pub fn invoke(&self, definition: &ProcessDefinition, invocation: Invocation) -> ProcessHandle {
        let id = ProcessId(self.core.next_process.fetch_add(1, Ordering::Relaxed) + 1);
        let (entry, parameter, escalation) = invocation.into_parts();
        let process = Process::new(id, Arc::clone(&self.core), definition, escalation);
        process.announce();

        let main = process.spawn_thread(NodeSeed::new(entry, parameter));
        if let Some(job) = main.start(None) {
            job.run();
        }
        ProcessHandle::new(process)
    }

    /// Scheduler-wide statistics.
    #[must_use]
    pub fn stats(&self) -> FlowStats {
        self.core.counters.snapshot()
    }

    /// Statistics per worker pool.
    #[must_use]
    pub fn pool_stats(&self) -> HashMap<PoolId, PoolStats> {
        self.core.pools.stats()
    }

    /// The registered pools.
    #[must_use]
    pub fn pools(&self) -> &PoolRegistry {
        &self.core.pools
    }

    /// Shut every pool down. Activations arriving afterwards run on the
    /// activating thread.
    pub fn shutdown(&self) {
        info!("shutting down scheduler");
        self.core.pools.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pools", &self.core.pools)
            .field("top_level", &self.core.top_level.as_ref().map(|p| p.name()))
            .finish_non_exhaustive()
    }
}

/// Builder for [`Scheduler`].
#[derive(Default)]
pub struct SchedulerBuilder {
    pools: Option<PoolRegistry>,
    top_level: Option<Arc<EscalationProcedure>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl SchedulerBuilder {
    /// Use these pools. Without this call a single passive pool named
    /// [`DEFAULT_POOL_NAME`] runs every step on the activating thread.
    #[must_use]
    pub fn pools(mut self, pools: PoolRegistry) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Use `pool` as the only (and default) pool.
    #[must_use]
    pub fn pool(self, pool: Arc<dyn WorkerPool>) -> Self {
        self.pools(PoolRegistry::new(pool))
    }

    /// Catch-all escalation procedure tried after every other scope.
    #[must_use]
    pub fn top_level_escalation(mut self, procedure: Arc<EscalationProcedure>) -> Self {
        self.top_level = Some(procedure);
        self
    }

    /// Where lifecycle events are recorded.
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Scheduler {
        let pools = self
            .pools
            .unwrap_or_else(|| PoolRegistry::new(Arc::new(PassivePool::new(DEFAULT_POOL_NAME))));
        info!(pools = ?pools, "scheduler initialized");
        Scheduler {
            core: Arc::new(SchedulerCore {
                pools,
                counters: FlowCounters::default(),
                audit: self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
                top_level: self.top_level,
                next_process: AtomicU64::new(0),
            }),
        }
    }
}
