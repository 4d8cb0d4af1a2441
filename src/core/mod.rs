//! Core scheduling abstractions: task definitions, the node state machine,
//! logical threads, processes, resources and worker pools.

pub mod audit;
pub mod context;
pub mod definition;
pub mod error;
pub mod escalation;
pub mod future;
pub mod node;
pub mod process;
pub mod resources;
pub mod scheduler;
pub mod stats;
pub mod supervision;
pub(crate) mod thread;
pub mod worker_pool;

pub use audit::{
    build_audit_event, AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, NullAuditSink,
};
pub use context::{ResumeHandle, TaskContext};
pub use definition::{
    DeactivationPolicy, Responsibility, SupervisionRequirement, TaskBody, TaskDefinition,
    TaskDefinitionBuilder, TaskFn, TaskKind,
};
pub use error::{AppResult, Failure, FailureKind, FlowError, FlowOutcome, TaskOutcome};
pub use escalation::{Escalation, EscalationLevel, EscalationProcedure, EscalationTrace};
pub use future::FlowFuture;
pub use node::{NodeId, NodeState};
pub use process::{
    Invocation, ProcessDefinition, ProcessDefinitionBuilder, ProcessHandle, ProcessId, ThreadId,
};
pub use resources::{
    Loaded, Readiness, ResourceDefinition, ResourceHandle, ResourceScope, ResourceSource,
    ResourceValue,
};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use stats::FlowStats;
pub use supervision::{Supervisor, Toggle};
pub use worker_pool::{Job, PassivePool, PoolId, PoolRegistry, PoolStats, Rejected, WorkerPool};
#[cfg(not(target_arch = "wasm32"))]
pub use worker_pool::ThreadedPool;
