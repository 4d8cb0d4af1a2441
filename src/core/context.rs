//! The view a task body gets of its node while it executes.

use std::any::Any;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::debug;

use super::definition::{DeactivationPolicy, TaskDefinition};
use super::error::Failure;
use super::future::FlowFuture;
use super::node::{NodeId, NodeSeed};
use super::process::ThreadId;
use super::resources::ResourceValue;
use super::thread::LogicalThread;

/// How a requested continuation is linked to the requesting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Instigation {
    Sequential,
    Parallel,
}

pub(crate) struct FlowRequest {
    pub instigation: Instigation,
    pub definition: Arc<TaskDefinition>,
    pub parameter: Value,
    pub policy: Option<DeactivationPolicy>,
}

pub(crate) struct JoinRequest {
    pub future: FlowFuture,
    pub timeout_millis: u64,
    pub token: Value,
}

/// Requests collected while the body ran.
pub(crate) struct Requests {
    pub complete: bool,
    pub flows: Vec<FlowRequest>,
    pub joins: Vec<JoinRequest>,
    pub started: Vec<Arc<LogicalThread>>,
}

/// Execution context handed to [`TaskBody::execute`](super::TaskBody::execute).
///
/// Continuations requested here take effect after the body returns: sequential
/// and parallel ones only if it succeeded, asynchronous ones always (their
/// logical thread already exists).
pub struct TaskContext<'a> {
    thread: &'a Arc<LogicalThread>,
    node: NodeId,
    definition: &'a TaskDefinition,
    parameter: &'a Value,
    cause: Option<&'a Failure>,
    resources: &'a [ResourceValue],
    executions: u32,
    requests: Requests,
}

impl<'a> TaskContext<'a> {
    pub(crate) const fn new(
        thread: &'a Arc<LogicalThread>,
        node: NodeId,
        definition: &'a TaskDefinition,
        parameter: &'a Value,
        cause: Option<&'a Failure>,
        resources: &'a [ResourceValue],
        executions: u32,
    ) -> Self {
        Self {
            thread,
            node,
            definition,
            parameter,
            cause,
            resources,
            executions,
            requests: Requests {
                complete: true,
                flows: Vec::new(),
                joins: Vec::new(),
                started: Vec::new(),
            },
        }
    }

    pub(crate) fn into_requests(self) -> Requests {
        self.requests
    }

    /// Input parameter: the previous node's result or the caller's value.
    #[must_use]
    pub const fn parameter(&self) -> &Value {
        self.parameter
    }

    /// For escalation handlers, the failure being handled.
    #[must_use]
    pub const fn failure(&self) -> Option<&Failure> {
        self.cause
    }

    /// Resource instances in the order the task definition lists them.
    #[must_use]
    pub const fn resources(&self) -> &[ResourceValue] {
        self.resources
    }

    /// The resource at `position`, if it exists and has type `T`.
    #[must_use]
    pub fn resource<T: Any + Send + Sync>(&self, position: usize) -> Option<&T> {
        self.resources.get(position)?.downcast_ref::<T>()
    }

    /// How many times this node's body has run, including this run.
    #[must_use]
    pub const fn execution_count(&self) -> u32 {
        self.executions
    }

    /// This node.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node
    }

    /// The logical thread running this node.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Name of the running task.
    #[must_use]
    pub fn task_name(&self) -> &str {
        self.definition.name()
    }

    /// Chain `definition` after this node on the same execution path.
    ///
    /// A second request converts the first one into a parallel child.
    pub fn sequential(&mut self, definition: Arc<TaskDefinition>, parameter: impl Into<Value>) {
        self.push(Instigation::Sequential, definition, parameter.into(), None);
    }

    /// [`sequential`](Self::sequential) with an explicit deactivation policy.
    pub fn sequential_with(
        &mut self,
        definition: Arc<TaskDefinition>,
        parameter: impl Into<Value>,
        policy: DeactivationPolicy,
    ) {
        self.push(Instigation::Sequential, definition, parameter.into(), Some(policy));
    }

    /// Fork `definition` as a parallel child path. This node waits for it
    /// before completing.
    pub fn parallel(&mut self, definition: Arc<TaskDefinition>, parameter: impl Into<Value>) {
        self.push(Instigation::Parallel, definition, parameter.into(), None);
    }

    /// [`parallel`](Self::parallel) with an explicit deactivation policy.
    pub fn parallel_with(
        &mut self,
        definition: Arc<TaskDefinition>,
        parameter: impl Into<Value>,
        policy: DeactivationPolicy,
    ) {
        self.push(Instigation::Parallel, definition, parameter.into(), Some(policy));
    }

    fn push(
        &mut self,
        instigation: Instigation,
        definition: Arc<TaskDefinition>,
        parameter: Value,
        policy: Option<DeactivationPolicy>,
    ) {
        debug!(task = definition.name(), ?instigation, "continuation requested");
        self.requests.flows.push(FlowRequest {
            instigation,
            definition,
            parameter,
            policy,
        });
    }

    /// Start `definition` on a new, decoupled logical thread.
    ///
    /// The thread exists as soon as this returns and is activated when the
    /// current step ends.
    pub fn asynchronous(
        &mut self,
        definition: Arc<TaskDefinition>,
        parameter: impl Into<Value>,
    ) -> FlowFuture {
        self.asynchronous_with(definition, parameter, None)
    }

    /// [`asynchronous`](Self::asynchronous) with an explicit deactivation policy.
    pub fn asynchronous_with(
        &mut self,
        definition: Arc<TaskDefinition>,
        parameter: impl Into<Value>,
        policy: impl Into<Option<DeactivationPolicy>>,
    ) -> FlowFuture {
        let seed = NodeSeed::new(definition, parameter.into())
            .policy(policy.into())
            .decoupled();
        let thread = self.thread.process().spawn_thread(seed);
        let future = thread.completion().clone();
        self.requests.started.push(thread);
        future
    }

    /// Wait for `future` before this node completes.
    ///
    /// The timeout and token are recorded with the wait; an elapsed timeout
    /// does not abandon it.
    pub fn join(&mut self, future: &FlowFuture, timeout_millis: u64, token: impl Into<Value>) {
        self.requests.joins.push(JoinRequest {
            future: future.clone(),
            timeout_millis,
            token: token.into(),
        });
    }

    /// Mark whether the body finished. An incomplete node stays in EXECUTE
    /// until [`ResumeHandle::resume`] is called.
    pub fn set_complete(&mut self, complete: bool) {
        self.requests.complete = complete;
    }

    /// Handle for waking (or failing) this node from outside the scheduler.
    #[must_use]
    pub fn resume_handle(&self) -> ResumeHandle {
        ResumeHandle {
            thread: Arc::downgrade(self.thread),
            node: self.node,
        }
    }
}

/// Re-activates a node that left itself incomplete.
#[derive(Clone)]
pub struct ResumeHandle {
    thread: Weak<LogicalThread>,
    node: NodeId,
}

impl ResumeHandle {
    /// Run the node's body again.
    pub fn resume(&self) {
        if let Some(thread) = self.thread.upgrade() {
            thread.resume(self.node);
        }
    }

    /// Hand `failure` back to the node; it fails and escalation starts.
    pub fn fail(&self, failure: Failure) {
        if let Some(thread) = self.thread.upgrade() {
            thread.inject_failure(self.node, failure);
        }
    }

    /// The node this handle wakes.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node
    }
}

impl std::fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeHandle").field("node", &self.node).finish()
    }
}
