//! Processes: one invocation of a process definition.
//!
//! A process owns the process-scoped resource table (guarded by the
//! resource-coordination lock), the fallback escalation procedures and the set
//! of live logical threads. It finishes when its last logical thread does.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::audit::{build_audit_event, AuditAction};
use super::definition::TaskDefinition;
use super::error::{Failure, FlowError, FlowOutcome};
use super::escalation::{EscalationProcedure, Fallbacks};
use super::future::FlowFuture;
use super::node::{NodeId, NodeSeed};
use super::resources::{ResourceDefinition, ResourceScope, ResourceTable};
use super::scheduler::SchedulerCore;
use super::supervision::Supervisor;
use super::thread::LogicalThread;

/// Identifier of a process, unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub(crate) u64);

impl ProcessId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a logical thread, unique within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub(crate) u64);

impl ThreadId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static description of a process: resources, supervisors and the
/// process-wide escalation procedure.
#[derive(Clone)]
pub struct ProcessDefinition {
    name: String,
    process_resources: Arc<[ResourceDefinition]>,
    thread_resources: Arc<[ResourceDefinition]>,
    supervisors: Arc<[Arc<dyn Supervisor>]>,
    escalation: Option<Arc<EscalationProcedure>>,
}

impl ProcessDefinition {
    /// Start building a process definition.
    pub fn builder(name: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder {
            name: name.into(),
            process_resources: Vec::new(),
            thread_resources: Vec::new(),
            supervisors: Vec::new(),
            escalation: None,
        }
    }

    /// Process name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resources shared by every logical thread of a process.
    #[must_use]
    pub fn process_resources(&self) -> &[ResourceDefinition] {
        &self.process_resources
    }

    /// Resources instantiated once per logical thread.
    #[must_use]
    pub fn thread_resources(&self) -> &[ResourceDefinition] {
        &self.thread_resources
    }

    /// Supervisors, indexed as task supervision requirements refer to them.
    #[must_use]
    pub fn supervisors(&self) -> &[Arc<dyn Supervisor>] {
        &self.supervisors
    }

    /// Process-wide escalation procedure.
    #[must_use]
    pub const fn escalation(&self) -> Option<&Arc<EscalationProcedure>> {
        self.escalation.as_ref()
    }
}

impl fmt::Debug for ProcessDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessDefinition")
            .field("name", &self.name)
            .field("process_resources", &self.process_resources.len())
            .field("thread_resources", &self.thread_resources.len())
            .field("supervisors", &self.supervisors.len())
            .field("escalation", &self.escalation.as_ref().map(|e| e.name()))
            .finish()
    }
}

/// Builder for [`ProcessDefinition`].
pub struct ProcessDefinitionBuilder {
    name: String,
    process_resources: Vec<ResourceDefinition>,
    thread_resources: Vec<ResourceDefinition>,
    supervisors: Vec<Arc<dyn Supervisor>>,
    escalation: Option<Arc<EscalationProcedure>>,
}

impl ProcessDefinitionBuilder {
    /// Add a process-scoped resource; its handle is `ResourceHandle::process(n)`
    /// where `n` counts previous calls.
    #[must_use]
    pub fn process_resource(mut self, resource: ResourceDefinition) -> Self {
        self.process_resources.push(resource);
        self
    }

    /// Add a thread-scoped resource; its handle is `ResourceHandle::thread(n)`.
    #[must_use]
    pub fn thread_resource(mut self, resource: ResourceDefinition) -> Self {
        self.thread_resources.push(resource);
        self
    }

    /// Add a supervisor at the next index.
    #[must_use]
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisors.push(supervisor);
        self
    }

    /// Set the process-wide escalation procedure.
    #[must_use]
    pub fn escalation(mut self, procedure: Arc<EscalationProcedure>) -> Self {
        self.escalation = Some(procedure);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> ProcessDefinition {
        ProcessDefinition {
            name: self.name,
            process_resources: self.process_resources.into(),
            thread_resources: self.thread_resources.into(),
            supervisors: self.supervisors.into(),
            escalation: self.escalation,
        }
    }
}

/// Arguments of one invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    entry: Arc<TaskDefinition>,
    parameter: Value,
    escalation: Option<Arc<EscalationProcedure>>,
}

impl Invocation {
    /// Invoke `entry` with a null parameter.
    #[must_use]
    pub const fn new(entry: Arc<TaskDefinition>) -> Self {
        Self {
            entry,
            parameter: Value::Null,
            escalation: None,
        }
    }

    /// Parameter of the entry task.
    #[must_use]
    pub fn parameter(mut self, parameter: impl Into<Value>) -> Self {
        self.parameter = parameter.into();
        self
    }

    /// Escalation procedure tried after the process-wide one.
    #[must_use]
    pub fn escalation(mut self, procedure: Arc<EscalationProcedure>) -> Self {
        self.escalation = Some(procedure);
        self
    }

    pub(crate) fn into_parts(self) -> (Arc<TaskDefinition>, Value, Option<Arc<EscalationProcedure>>) {
        (self.entry, self.parameter, self.escalation)
    }
}

#[derive(Default)]
struct ThreadRegistry {
    live: HashMap<ThreadId, Arc<LogicalThread>>,
    next_id: u64,
    main: Option<ThreadId>,
    main_result: Option<Value>,
    failure: Option<Failure>,
    finished: bool,
}

/// A running process.
pub(crate) struct Process {
    id: ProcessId,
    name: String,
    core: Arc<SchedulerCore>,
    /// Process resource-coordination lock.
    resources: Mutex<ResourceTable>,
    thread_resources: Arc<[ResourceDefinition]>,
    supervisors: Arc<[Arc<dyn Supervisor>]>,
    fallbacks: Fallbacks,
    threads: Mutex<ThreadRegistry>,
    completion: FlowFuture,
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        core: Arc<SchedulerCore>,
        definition: &ProcessDefinition,
        invocation: Option<Arc<EscalationProcedure>>,
    ) -> Arc<Self> {
        let fallbacks = Fallbacks {
            process_wide: definition.escalation.clone(),
            invocation,
            top_level: core.top_level.clone(),
        };
        Arc::new(Self {
            id,
            name: definition.name.clone(),
            resources: Mutex::new(ResourceTable::new(
                ResourceScope::Process,
                Arc::clone(&definition.process_resources),
            )),
            thread_resources: Arc::clone(&definition.thread_resources),
            supervisors: Arc::clone(&definition.supervisors),
            fallbacks,
            threads: Mutex::new(ThreadRegistry::default()),
            completion: FlowFuture::new(),
            core,
        })
    }

    pub(crate) const fn id(&self) -> ProcessId {
        self.id
    }

    pub(crate) fn core(&self) -> &SchedulerCore {
        &self.core
    }

    pub(crate) const fn resources(&self) -> &Mutex<ResourceTable> {
        &self.resources
    }

    pub(crate) const fn thread_resources(&self) -> &Arc<[ResourceDefinition]> {
        &self.thread_resources
    }

    pub(crate) const fn supervisors(&self) -> &Arc<[Arc<dyn Supervisor>]> {
        &self.supervisors
    }

    pub(crate) const fn fallbacks(&self) -> &Fallbacks {
        &self.fallbacks
    }

    /// Create a logical thread rooted at `seed`. The first thread created is
    /// the main thread, whose result becomes the process result.
    pub(crate) fn spawn_thread(self: &Arc<Self>, seed: NodeSeed) -> Arc<LogicalThread> {
        let id = {
            let mut threads = self.threads.lock();
            threads.next_id += 1;
            let id = ThreadId(threads.next_id);
            threads.main.get_or_insert(id);
            id
        };
        self.core.counters.thread_started();
        info!(process = %self.id, thread = %id, task = seed.definition.name(), "logical thread started");
        self.record(Some(id), None, AuditAction::ThreadStarted, None);

        let thread = LogicalThread::new(id, Arc::clone(self), seed);
        self.threads.lock().live.insert(id, Arc::clone(&thread));
        thread
    }

    /// Bookkeeping when a logical thread finishes; finishes the process with
    /// the last one.
    pub(crate) fn thread_finished(&self, id: ThreadId, outcome: &FlowOutcome) {
        self.core.counters.thread_completed();
        self.record(
            Some(id),
            None,
            AuditAction::ThreadCompleted,
            serde_json::to_value(outcome).ok(),
        );
        let finished = {
            let mut threads = self.threads.lock();
            threads.live.remove(&id);
            match outcome {
                FlowOutcome::Failed(failure) => {
                    threads.failure.get_or_insert_with(|| failure.clone());
                }
                FlowOutcome::Completed(value) => {
                    if threads.main == Some(id) {
                        threads.main_result = Some(value.clone());
                    }
                }
            }
            if threads.finished || !threads.live.is_empty() {
                None
            } else {
                threads.finished = true;
                Some(match threads.failure.take() {
                    Some(failure) => FlowOutcome::Failed(failure),
                    None => FlowOutcome::Completed(threads.main_result.take().unwrap_or(Value::Null)),
                })
            }
        };
        if let Some(outcome) = finished {
            self.finish(outcome);
        }
    }

    fn finish(&self, outcome: FlowOutcome) {
        for failure in self.resources.lock().release_all() {
            debug!(process = %self.id, %failure, "process resource release failure swallowed");
        }
        let failed = !outcome.is_completed();
        self.core.counters.process_completed(failed);
        if failed {
            warn!(process = %self.id, name = %self.name, "process finished in the failed state");
        } else {
            info!(process = %self.id, name = %self.name, "process completed");
        }
        self.record(
            None,
            None,
            AuditAction::ProcessCompleted,
            serde_json::to_value(&outcome).ok(),
        );
        self.completion.resolve(outcome);
    }

    pub(crate) fn record(
        &self,
        thread: Option<ThreadId>,
        node: Option<(NodeId, &str)>,
        action: AuditAction,
        payload: Option<Value>,
    ) {
        self.core.audit.record(build_audit_event(
            self.id.get(),
            thread.map(ThreadId::get),
            node.map(|(id, _)| id.get()),
            node.map(|(_, task)| task),
            action,
            payload,
        ));
    }

    pub(crate) fn announce(&self) {
        self.core.counters.process_started();
        info!(process = %self.id, name = %self.name, "process started");
        self.record(
            None,
            None,
            AuditAction::ProcessStarted,
            Some(json!({ "name": self.name })),
        );
    }
}

/// Host-side handle on an invoked process.
#[derive(Clone)]
pub struct ProcessHandle {
    process: Arc<Process>,
}

impl ProcessHandle {
    pub(crate) const fn new(process: Arc<Process>) -> Self {
        Self { process }
    }

    /// Process id.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.process.id
    }

    /// Name of the process definition.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.process.name
    }

    /// Whether the process finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.process.completion.is_complete()
    }

    /// The outcome, if finished.
    #[must_use]
    pub fn outcome(&self) -> Option<FlowOutcome> {
        self.process.completion.outcome()
    }

    /// Completion handle of the whole process.
    #[must_use]
    pub fn completion(&self) -> FlowFuture {
        self.process.completion.clone()
    }

    /// Number of logical threads still running.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.process.threads.lock().live.len()
    }

    /// Block until the process finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `FlowError::Timeout` if it is still running.
    pub fn wait(&self, timeout: Duration) -> Result<FlowOutcome, FlowError> {
        self.process.completion.wait(timeout)
    }

    /// Wait asynchronously until the process finishes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `FlowError::Timeout` if it is still running.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<FlowOutcome, FlowError> {
        self.process.completion.wait_async(timeout).await
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.process.id)
            .field("name", &self.process.name)
            .field("complete", &self.is_complete())
            .finish()
    }
}
