//! Logical threads: the unit that runs task nodes strictly one step at a time.
//!
//! A thread owns an arena of nodes and execution paths ([`FlowTree`]), a ready
//! queue of activated nodes and a `draining` flag. Whoever flips `draining`
//! from false to true owns the thread's step slot: it pops nodes off the ready
//! queue and runs their steps until the queue is empty. Every other activation
//! only enqueues. That is what guarantees a single active step per thread
//! without a worker ever blocking on another worker.
//!
//! The state lock is never held while user code runs (task bodies, resource
//! sources, supervisors), so that code may freely complete readiness signals,
//! resume nodes or start other flows.

use std::collections::VecDeque;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, info, trace, warn};

use super::audit::AuditAction;
use super::context::{FlowRequest, Instigation, JoinRequest, TaskContext};
use super::definition::{DeactivationPolicy, Responsibility, TaskDefinition};
use super::error::{Failure, FlowError, FlowOutcome, TaskOutcome};
use super::escalation::{EscalationLevel, EscalationProcedure, EscalationTrace};
use super::future::FlowFuture;
use super::node::{FlowTree, NodeId, NodeSeed, NodeState, PathId, Retired, TaskNode};
use super::process::{Process, ThreadId};
use super::resources::{ResourceContainer, ResourceScope, ResourceTable, ResourceValue};
use super::supervision::SupervisionGrants;
use super::worker_pool::{Job, PoolId};

/// Re-activates one node when a readiness signal fires.
#[derive(Clone)]
pub(crate) struct Wakeup {
    target: Option<(Weak<LogicalThread>, NodeId)>,
}

impl Wakeup {
    fn new(thread: &Arc<LogicalThread>, node: NodeId) -> Self {
        Self {
            target: Some((Arc::downgrade(thread), node)),
        }
    }

    /// A waiter that wakes nothing.
    #[cfg(test)]
    pub const fn detached() -> Self {
        Self { target: None }
    }

    pub fn same_target(&self, other: &Self) -> bool {
        match (&self.target, &other.target) {
            (Some((a, n)), Some((b, m))) => n == m && Weak::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn wake(&self) {
        let Some((thread, node)) = &self.target else {
            return;
        };
        if let Some(thread) = thread.upgrade() {
            thread.wake(*node);
        }
    }
}

/// Result of one `run_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepStatus {
    /// Something else re-activates the node later.
    Pending,
    /// The node gave up its step (completed, failed, or moved on).
    Handled,
}

enum Phase {
    Continue,
    Pending,
    Handled,
}

enum ResourceProgress {
    Pending(NodeState),
    Ready(Vec<ResourceValue>),
}

/// Work deferred until the state lock is released.
enum PostStep {
    Activate(NodeId),
    Start(Arc<LogicalThread>),
    Join { node: NodeId, join: JoinRequest },
    ReleaseGrants(DeactivationPolicy),
    Finish(FlowOutcome),
}

enum Next {
    Run(NodeId),
    Handoff(NodeId, PoolId),
    Skip,
}

struct ThreadState {
    tree: FlowTree,
    entry: NodeId,
    ready: VecDeque<NodeId>,
    draining: bool,
    escalation_level: EscalationLevel,
    failure_slot: Option<(NodeId, Failure)>,
    last_result: Value,
    finished: bool,
}

struct ThreadResources {
    table: ResourceTable,
    grants: SupervisionGrants,
}

/// A single-active-at-a-time run of task nodes.
pub(crate) struct LogicalThread {
    id: ThreadId,
    process: Arc<Process>,
    state: Mutex<ThreadState>,
    resources: Mutex<ThreadResources>,
    completion: FlowFuture,
    active_steps: AtomicUsize,
}

impl LogicalThread {
    pub(crate) fn new(id: ThreadId, process: Arc<Process>, seed: NodeSeed) -> Arc<Self> {
        let mut tree = FlowTree::default();
        let entry = tree.open_path(None, seed, None);
        let resources = ThreadResources {
            table: ResourceTable::new(ResourceScope::Thread, Arc::clone(process.thread_resources())),
            grants: SupervisionGrants::new(process.supervisors()),
        };
        let thread = Arc::new(Self {
            id,
            process,
            state: Mutex::new(ThreadState {
                tree,
                entry,
                ready: VecDeque::new(),
                draining: false,
                escalation_level: EscalationLevel::Ancestors,
                failure_slot: None,
                last_result: Value::Null,
                finished: false,
            }),
            resources: Mutex::new(resources),
            completion: FlowFuture::new(),
            active_steps: AtomicUsize::new(0),
        });
        {
            let state = thread.state.lock();
            thread.created(&state, entry);
        }
        thread
    }

    pub(crate) const fn id(&self) -> ThreadId {
        self.id
    }

    pub(crate) const fn process(&self) -> &Arc<Process> {
        &self.process
    }

    pub(crate) const fn completion(&self) -> &FlowFuture {
        &self.completion
    }

    /// Activate the entry node.
    pub(crate) fn start(self: &Arc<Self>, calling: Option<&PoolId>) -> Option<Job> {
        let entry = self.state.lock().entry;
        self.activate(entry, calling)
    }

    /// Queue `id` for a step.
    ///
    /// No-op if the node is already queued, finished, or still waiting for
    /// parallel children or joins (the last of those re-activates it). Returns
    /// a job the caller must run itself: either because it already runs on
    /// the responsible pool, or because the pool rejected the hand-off.
    pub(crate) fn activate(self: &Arc<Self>, id: NodeId, calling: Option<&PoolId>) -> Option<Job> {
        let responsibility = {
            let mut state = self.state.lock();
            Self::enqueue(&mut state, id, |node| !node.is_waiting())?
        };
        self.dispatch(id, &responsibility, calling)
    }

    /// Readiness fired for a node in a resource phase.
    fn wake(self: &Arc<Self>, id: NodeId) {
        let responsibility = {
            let mut state = self.state.lock();
            Self::enqueue(&mut state, id, |node| node.state.is_resource_phase())
        };
        if let Some(job) = responsibility.and_then(|r| self.dispatch(id, &r, None)) {
            job.run();
        }
    }

    /// Explicit resume of a node that left itself incomplete.
    pub(crate) fn resume(self: &Arc<Self>, id: NodeId) {
        let responsibility = {
            let mut state = self.state.lock();
            Self::enqueue(&mut state, id, |node| {
                let suspended = node.state == NodeState::Execute && node.suspended;
                if suspended && !node.is_waiting() {
                    node.suspended = false;
                    return true;
                }
                if matches!(node.state, NodeState::Execute | NodeState::HandleCompletion) {
                    node.resume_pending = true;
                }
                false
            })
        };
        if let Some(job) = responsibility.and_then(|r| self.dispatch(id, &r, None)) {
            job.run();
        }
    }

    /// Hand a failure caught outside the scheduler back into the state machine.
    pub(crate) fn inject_failure(self: &Arc<Self>, id: NodeId, failure: Failure) {
        let responsibility = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.finished || state.tree.node(id).is_none() {
                warn!(thread = %self.id, node = %id, %failure, "failure for a finished node ignored");
                return;
            }
            if let Some((pending, _)) = &state.failure_slot {
                warn!(
                    thread = %self.id,
                    pending = %pending,
                    %failure,
                    "failure slot occupied, secondary failure swallowed"
                );
                return;
            }
            state.failure_slot = Some((id, failure));
            Self::enqueue(state, id, |_| true)
        };
        if let Some(job) = responsibility.and_then(|r| self.dispatch(id, &r, None)) {
            job.run();
        }
    }

    fn take_failure(state: &mut ThreadState, id: NodeId) -> Option<Failure> {
        if state.failure_slot.as_ref().is_some_and(|(n, _)| *n == id) {
            return state.failure_slot.take().map(|(_, failure)| failure);
        }
        None
    }

    /// Clear a slot entry whose node is gone from the tree.
    fn drop_stale_failure(&self, state: &mut ThreadState) {
        let stale = state
            .failure_slot
            .as_ref()
            .is_some_and(|(n, _)| state.tree.node(*n).is_none());
        if stale {
            if let Some((node, failure)) = state.failure_slot.take() {
                warn!(thread = %self.id, node = %node, %failure, "failure of a vanished node dropped");
            }
        }
    }

    /// A joined future resolved.
    fn resolve_join(self: &Arc<Self>, id: NodeId) -> Option<Job> {
        let responsibility = {
            let mut state = self.state.lock();
            let node = state.tree.node_mut(id)?;
            node.pending_joins = node.pending_joins.saturating_sub(1);
            Self::enqueue(&mut state, id, |node| !node.is_waiting())?
        };
        self.dispatch(id, &responsibility, None)
    }

    /// Push `id` onto the ready queue if `gate` allows it. Returns the
    /// responsibility to dispatch with when nobody is draining yet.
    fn enqueue(
        state: &mut ThreadState,
        id: NodeId,
        gate: impl FnOnce(&mut TaskNode) -> bool,
    ) -> Option<Responsibility> {
        if state.finished {
            return None;
        }
        let node = state.tree.node_mut(id)?;
        if node.queued || node.state.is_terminal() || !gate(node) {
            trace!(node = %id, "activation is a no-op");
            return None;
        }
        node.queued = true;
        let responsibility = node.responsibility.clone();
        state.ready.push_back(id);
        if state.draining {
            return None;
        }
        state.draining = true;
        Some(responsibility)
    }

    fn dispatch(
        self: &Arc<Self>,
        node: NodeId,
        responsibility: &Responsibility,
        calling: Option<&PoolId>,
    ) -> Option<Job> {
        let pools = &self.process.core().pools;
        let target = pools.target(responsibility, calling);
        let job = Job::new(Arc::clone(self), node, target.clone());
        let decoupled = matches!(responsibility, Responsibility::Decoupled);
        if !decoupled && calling == Some(&target) {
            return Some(job);
        }
        match pools.assign(job) {
            Ok(()) => None,
            Err(rejected) => {
                warn!(
                    thread = %self.id,
                    node = %node,
                    pool = %target,
                    error = %rejected.error,
                    "assignment rejected, running on caller"
                );
                Some(rejected.job)
            }
        }
    }

    /// Run queued steps until the ready queue is empty or the next node
    /// belongs to another pool.
    pub(crate) fn drain(self: &Arc<Self>, pool: &PoolId, origin: NodeId, follow: &mut VecDeque<Job>) {
        let pools = &self.process.core().pools;
        let mut pool = pool.clone();
        let mut origin = Some(origin);
        loop {
            let next = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.finished {
                    state.ready.clear();
                    state.draining = false;
                    return;
                }
                let Some(&id) = state.ready.front() else {
                    state.draining = false;
                    return;
                };
                match state.tree.node_mut(id) {
                    None => {
                        state.ready.pop_front();
                        self.drop_stale_failure(state);
                        Next::Skip
                    }
                    Some(node) => {
                        let target = pools.target(&node.responsibility, Some(&pool));
                        let decoupled = matches!(node.responsibility, Responsibility::Decoupled);
                        if target != pool || (decoupled && origin != Some(id)) {
                            Next::Handoff(id, target)
                        } else {
                            node.queued = false;
                            state.ready.pop_front();
                            Next::Run(id)
                        }
                    }
                }
            };
            match next {
                Next::Skip => {}
                Next::Run(id) => {
                    origin = None;
                    let status = self.run_step(id, &pool, follow);
                    trace!(thread = %self.id, node = %id, ?status, "step finished");
                }
                Next::Handoff(id, target) => {
                    match pools.assign(Job::new(Arc::clone(self), id, target.clone())) {
                        Ok(()) => return,
                        Err(rejected) => {
                            warn!(
                                thread = %self.id,
                                node = %id,
                                pool = %target,
                                error = %rejected.error,
                                "hand-off rejected, continuing on caller"
                            );
                            pool = target;
                            origin = Some(id);
                        }
                    }
                }
            }
        }
    }

    /// Drive one node through as many phases as it can take right now.
    pub(crate) fn run_step(
        self: &Arc<Self>,
        id: NodeId,
        pool: &PoolId,
        follow: &mut VecDeque<Job>,
    ) -> StepStatus {
        let active = self.active_steps.fetch_add(1, Ordering::SeqCst) + 1;
        self.process.core().counters.observe_active_steps(active);
        let mut post = Vec::new();
        let status = self.advance(id, &mut post);
        self.active_steps.fetch_sub(1, Ordering::SeqCst);
        self.apply(post, pool, follow);
        status
    }

    fn advance(self: &Arc<Self>, id: NodeId, post: &mut Vec<PostStep>) -> StepStatus {
        loop {
            let current = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.finished {
                    return StepStatus::Handled;
                }
                // A failure reported for this node wins over any later phase.
                if let Some(failure) = Self::take_failure(state, id) {
                    self.fail_node(state, id, failure, post);
                    return StepStatus::Handled;
                }
                match state.tree.node(id) {
                    Some(node) => node.state,
                    None => return StepStatus::Handled,
                }
            };
            let phase = match current {
                NodeState::LoadResources
                | NodeState::GovernResources
                | NodeState::CoordinateResources => self.resource_phases(id, current, post),
                NodeState::Execute => self.execute(id, post),
                NodeState::HandleCompletion => self.handle_completion(id),
                NodeState::ActivateNext => self.activate_next(id, post),
                NodeState::Completed | NodeState::Failed => Phase::Handled,
            };
            match phase {
                Phase::Continue => {}
                Phase::Pending => return StepStatus::Pending,
                Phase::Handled => return StepStatus::Handled,
            }
        }
    }

    fn resource_phases(
        self: &Arc<Self>,
        id: NodeId,
        current: NodeState,
        post: &mut Vec<PostStep>,
    ) -> Phase {
        let (definition, policy) = match self.state.lock().tree.node(id) {
            Some(node) => (Arc::clone(&node.definition), node.policy),
            None => return Phase::Handled,
        };
        if !definition.needs_resource_phases() {
            if let Some(node) = self.state.lock().tree.node_mut(id) {
                node.state = NodeState::Execute;
            }
            return Phase::Continue;
        }

        let waiter = Wakeup::new(self, id);
        let progress = {
            let mut process_table =
                (!definition.resources().is_empty()).then(|| self.process.resources().lock());
            let mut local = self.resources.lock();
            let local = &mut *local;
            let mut container = ResourceContainer::new(
                process_table.as_deref_mut(),
                &mut local.table,
                &mut local.grants,
            );
            Self::drive_resources(&mut container, &definition, policy, current, &waiter)
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match progress {
            Ok(ResourceProgress::Pending(phase)) => {
                if let Some(node) = state.tree.node_mut(id) {
                    node.state = phase;
                }
                debug!(thread = %self.id, node = %id, task = definition.name(), ?phase, "resources not ready");
                Phase::Pending
            }
            Ok(ResourceProgress::Ready(values)) => {
                if let Some(node) = state.tree.node_mut(id) {
                    node.resources = values;
                    node.state = NodeState::Execute;
                }
                Phase::Continue
            }
            Err(failure) => {
                self.fail_node(state, id, failure, post);
                Phase::Handled
            }
        }
    }

    fn drive_resources(
        container: &mut ResourceContainer<'_>,
        definition: &TaskDefinition,
        policy: DeactivationPolicy,
        mut phase: NodeState,
        waiter: &Wakeup,
    ) -> Result<ResourceProgress, Failure> {
        let handles = definition.resources();
        loop {
            match phase {
                NodeState::LoadResources => {
                    container.load_resources(handles)?;
                    phase = NodeState::GovernResources;
                }
                NodeState::GovernResources => {
                    if !container.govern_resources(definition.supervision(), policy, handles, waiter)? {
                        return Ok(ResourceProgress::Pending(phase));
                    }
                    phase = NodeState::CoordinateResources;
                }
                NodeState::CoordinateResources => {
                    if !container.coordinate_resources(handles, waiter)?
                        || !container.resources_ready(handles, waiter)?
                    {
                        return Ok(ResourceProgress::Pending(phase));
                    }
                    return Ok(ResourceProgress::Ready(container.values(handles)?));
                }
                other => unreachable!("resource phases driven from {other:?}"),
            }
        }
    }

    fn execute(self: &Arc<Self>, id: NodeId, post: &mut Vec<PostStep>) -> Phase {
        let (definition, parameter, cause, resources, executions) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(node) = state.tree.node_mut(id) else {
                return Phase::Handled;
            };
            let setup = if node.setup_spawned {
                None
            } else {
                node.definition.setup().cloned()
            };
            if let Some(setup) = setup {
                node.setup_spawned = true;
                let seed = NodeSeed::new(setup, node.parameter.clone())
                    .inherit(node.escalation.clone())
                    .policy(Some(node.policy));
                let child = state.tree.open_path(Some(id), seed, None);
                self.created(state, child);
                post.push(PostStep::Activate(child));
                debug!(thread = %self.id, node = %id, setup = %child, "setup runs before the body");
                return Phase::Pending;
            }
            node.executions += 1;
            node.resume_pending = false;
            (
                Arc::clone(&node.definition),
                node.parameter.clone(),
                node.cause.clone(),
                node.resources.clone(),
                node.executions,
            )
        };

        debug!(thread = %self.id, node = %id, task = definition.name(), executions, "executing task");
        let mut ctx = TaskContext::new(
            self,
            id,
            &definition,
            &parameter,
            cause.as_ref(),
            &resources,
            executions,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| definition.body().execute(&mut ctx)))
            .unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                error!(thread = %self.id, node = %id, task = definition.name(), %reason, "task body panicked");
                TaskOutcome::FrameworkFatal(FlowError::Internal(format!(
                    "task '{}' panicked: {reason}",
                    definition.name()
                )))
            });
        let requests = ctx.into_requests();
        post.extend(requests.started.into_iter().map(PostStep::Start));

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.finished {
            return Phase::Handled;
        }
        let Some(node) = state.tree.node_mut(id) else {
            return Phase::Handled;
        };
        node.pending_joins += requests.joins.len();
        post.extend(
            requests
                .joins
                .into_iter()
                .map(|join| PostStep::Join { node: id, join }),
        );
        match outcome {
            TaskOutcome::Success(value) => {
                node.result = value;
                node.suspended = !requests.complete;
                node.state = NodeState::HandleCompletion;
                let inherited = node.escalation.clone();
                for flow in requests.flows {
                    self.instigate(state, id, flow, inherited.clone(), post);
                }
                Phase::Continue
            }
            TaskOutcome::ApplicationFailure(failure) => {
                self.fail_node(state, id, failure, post);
                Phase::Handled
            }
            TaskOutcome::FrameworkFatal(error) => {
                self.fatal(state, &error, post);
                Phase::Handled
            }
        }
    }

    fn instigate(
        &self,
        state: &mut ThreadState,
        id: NodeId,
        flow: FlowRequest,
        inherited: Option<Arc<EscalationProcedure>>,
        post: &mut Vec<PostStep>,
    ) {
        let seed = NodeSeed::new(flow.definition, flow.parameter)
            .inherit(inherited)
            .policy(flow.policy);
        match flow.instigation {
            Instigation::Sequential => {
                // Only one continuation can be chained; an earlier one becomes a
                // parallel child. The converted path carries no handler marker.
                if let Some(converted) = state.tree.convert_next_to_parallel(id) {
                    debug!(
                        thread = %self.id,
                        node = %id,
                        converted = %converted,
                        "pending sequential continuation converted to parallel"
                    );
                    post.push(PostStep::Activate(converted));
                }
                if let Some(next) = state.tree.chain(id, seed) {
                    self.created(state, next);
                }
            }
            Instigation::Parallel => {
                let child = state.tree.open_path(Some(id), seed, None);
                self.created(state, child);
                post.push(PostStep::Activate(child));
            }
        }
    }

    fn handle_completion(&self, id: NodeId) -> Phase {
        let mut state = self.state.lock();
        let Some(node) = state.tree.node_mut(id) else {
            return Phase::Handled;
        };
        if node.suspended {
            node.state = NodeState::Execute;
            if node.is_waiting() {
                // The last child re-activates the node, which runs the body again.
                node.suspended = false;
                node.resume_pending = false;
            } else if node.resume_pending {
                node.suspended = false;
                node.resume_pending = false;
                return Phase::Continue;
            }
            debug!(thread = %self.id, node = %id, task = node.name(), "task left itself incomplete");
            return Phase::Pending;
        }
        if node.is_waiting() {
            debug!(
                thread = %self.id,
                node = %id,
                children = node.children.len(),
                joins = node.pending_joins,
                "waiting for parallel subtree"
            );
            return Phase::Pending;
        }
        node.state = NodeState::ActivateNext;
        Phase::Continue
    }

    fn activate_next(&self, id: NodeId, post: &mut Vec<PostStep>) -> Phase {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(failure) = Self::take_failure(state, id) {
            self.fail_node(state, id, failure, post);
            return Phase::Handled;
        }
        let Some(node) = state.tree.node_mut(id) else {
            return Phase::Handled;
        };
        let static_next = if node.next.is_some() {
            None
        } else {
            node.definition.next().cloned()
        };
        node.state = NodeState::Completed;
        let result = node.result.clone();
        let inherited = node.escalation.clone();
        let definition = Arc::clone(&node.definition);

        if let Some(next) = static_next {
            let seed = NodeSeed::new(next, result.clone()).inherit(inherited);
            if let Some(next) = state.tree.chain(id, seed) {
                self.created(state, next);
            }
        }

        self.process.core().counters.node_completed();
        debug!(thread = %self.id, node = %id, task = definition.name(), "task completed");
        self.record(AuditAction::NodeCompleted, Some((id, definition.name())), None);

        match state.tree.retire(id) {
            Retired::Next(next) => post.push(PostStep::Activate(next)),
            Retired::PathDone { owner: Some(owner) } => post.push(PostStep::Activate(owner)),
            Retired::PathDone { owner: None } => {
                state.last_result = result;
                if state.tree.len() == 0 {
                    let outcome = FlowOutcome::Completed(state.last_result.clone());
                    self.finish(state, outcome, post);
                }
            }
        }
        Phase::Handled
    }

    /// Escalation search for a failure raised by node `id`.
    ///
    /// Walks the failing node and its parallel-owner chain. The first
    /// procedure that catches the failure wins: the path directly below the
    /// catching node is cleared and the handler takes its place. Procedures
    /// that spawned a handler on the walked paths are skipped. If nothing on
    /// the chain matches, the whole tree is cleared and the process fallbacks
    /// are tried above the thread's current escalation level.
    fn fail_node(
        &self,
        state: &mut ThreadState,
        id: NodeId,
        failure: Failure,
        post: &mut Vec<PostStep>,
    ) {
        let core = self.process.core();
        core.counters.failure();
        let Some(node) = state.tree.node_mut(id) else {
            warn!(thread = %self.id, node = %id, %failure, "failure for a vanished node swallowed");
            return;
        };
        node.state = NodeState::Failed;
        warn!(thread = %self.id, node = %id, task = node.name(), %failure, "task failed");
        let task = Arc::clone(&node.definition);
        self.record(
            AuditAction::NodeFailed,
            Some((id, task.name())),
            serde_json::to_value(&failure).ok(),
        );

        let mut trace = EscalationTrace {
            visited: vec![EscalationLevel::Ancestors],
            matched: None,
        };
        if let Some((cleared, procedure, handler)) = Self::search_ancestors(&state.tree, id, &failure) {
            trace.matched = Some(EscalationLevel::Ancestors);
            let owner = state.tree.path(cleared).and_then(|p| p.owner);
            let inherited = owner
                .and_then(|o| state.tree.node(o))
                .and_then(|n| n.escalation.clone());
            self.clear_path(state, cleared);
            let handler_node = self.spawn_handler(state, owner, handler, procedure, inherited, failure, post);
            self.escalated(state, handler_node, &trace);
            return;
        }

        let mut cleared = Vec::new();
        state.tree.clear_all(&mut cleared);
        self.note_cleared(state, &cleared);
        post.push(PostStep::ReleaseGrants(DeactivationPolicy::Disregard));

        match self
            .process
            .fallbacks()
            .resolve(state.escalation_level, &failure, &mut trace)
        {
            Some((level, procedure, handler)) => {
                state.escalation_level = level;
                let handler_node = self.spawn_handler(state, None, handler, procedure, None, failure, post);
                self.escalated(state, handler_node, &trace);
            }
            None => {
                state.escalation_level = EscalationLevel::Fatal;
                core.counters.fatal_failure();
                error!(
                    process = %self.process.id(),
                    thread = %self.id,
                    task = task.name(),
                    %failure,
                    visited = ?trace.visited,
                    "unhandled failure, logical thread failed"
                );
                self.record(
                    AuditAction::FatalFailure,
                    Some((id, task.name())),
                    Some(json!({ "failure": failure, "trace": trace })),
                );
                self.finish(state, FlowOutcome::Failed(failure), post);
            }
        }
    }

    /// Find the nearest procedure catching `failure` on the owner chain of
    /// `id`. Returns the path to clear, the procedure and its handler.
    fn search_ancestors(
        tree: &FlowTree,
        id: NodeId,
        failure: &Failure,
    ) -> Option<(PathId, Arc<EscalationProcedure>, Arc<TaskDefinition>)> {
        let mut excluded: Vec<&Arc<EscalationProcedure>> = Vec::new();
        let mut below: Option<PathId> = None;
        let mut current = id;
        loop {
            let node = tree.node(current)?;
            let path = tree.path(node.path)?;
            if let Some(origin) = &path.handler_for {
                excluded.push(origin);
            }
            if let Some(procedure) = &node.escalation {
                let skip = excluded.iter().any(|e| Arc::ptr_eq(e, procedure));
                if !skip {
                    if let Some(handler) = procedure.find(failure) {
                        let cleared = below.unwrap_or(node.path);
                        return Some((cleared, Arc::clone(procedure), Arc::clone(handler)));
                    }
                }
            }
            below = Some(node.path);
            current = path.owner?;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_handler(
        &self,
        state: &mut ThreadState,
        owner: Option<NodeId>,
        handler: Arc<TaskDefinition>,
        procedure: Arc<EscalationProcedure>,
        inherited: Option<Arc<EscalationProcedure>>,
        failure: Failure,
        post: &mut Vec<PostStep>,
    ) -> NodeId {
        let parameter = serde_json::to_value(&failure).unwrap_or(Value::Null);
        let mut seed = NodeSeed::new(handler, parameter)
            .inherit(inherited)
            .policy(Some(DeactivationPolicy::Disregard));
        seed.cause = Some(failure);
        let node = state.tree.open_path(owner, seed, Some(procedure));
        self.created(state, node);
        post.push(PostStep::Activate(node));
        node
    }

    fn escalated(&self, state: &ThreadState, handler: NodeId, trace: &EscalationTrace) {
        self.process.core().counters.escalation_handled();
        let name = state.tree.node(handler).map_or("", TaskNode::name);
        info!(thread = %self.id, handler = %handler, task = name, matched = ?trace.matched, "failure escalated to handler");
        self.record(
            AuditAction::Escalated,
            Some((handler, name)),
            serde_json::to_value(trace).ok(),
        );
    }

    /// A task reported a framework-fatal error: no escalation is tried.
    fn fatal(&self, state: &mut ThreadState, error: &FlowError, post: &mut Vec<PostStep>) {
        let failure = Failure::fatal(error);
        self.process.core().counters.fatal_failure();
        error!(thread = %self.id, %error, "framework failure, logical thread failed");
        let mut cleared = Vec::new();
        state.tree.clear_all(&mut cleared);
        self.note_cleared(state, &cleared);
        post.push(PostStep::ReleaseGrants(DeactivationPolicy::Disregard));
        self.record(
            AuditAction::FatalFailure,
            None,
            Some(json!({ "failure": failure })),
        );
        self.finish(state, FlowOutcome::Failed(failure), post);
    }

    fn clear_path(&self, state: &mut ThreadState, path: PathId) {
        let mut cleared = Vec::new();
        state.tree.clear_path(path, &mut cleared);
        self.note_cleared(state, &cleared);
    }

    fn note_cleared(&self, state: &mut ThreadState, cleared: &[TaskNode]) {
        if cleared.is_empty() {
            return;
        }
        self.process.core().counters.nodes_cleared(cleared.len());
        for node in cleared {
            debug!(thread = %self.id, node = %node.id, task = node.name(), "node cleared");
            self.record(AuditAction::NodeCleared, Some((node.id, node.name())), None);
            if state.failure_slot.as_ref().is_some_and(|(n, _)| *n == node.id) {
                if let Some((_, failure)) = state.failure_slot.take() {
                    warn!(thread = %self.id, node = %node.id, %failure, "pending failure of a cleared node swallowed");
                }
            }
        }
    }

    fn finish(&self, state: &mut ThreadState, outcome: FlowOutcome, post: &mut Vec<PostStep>) {
        state.finished = true;
        state.ready.clear();
        let mut leftover = Vec::new();
        state.tree.clear_all(&mut leftover);
        self.note_cleared(state, &leftover);
        post.push(PostStep::Finish(outcome));
    }

    fn created(&self, state: &ThreadState, id: NodeId) {
        self.process.core().counters.node_created();
        if let Some(node) = state.tree.node(id) {
            trace!(thread = %self.id, node = %id, task = node.name(), "node created");
            self.record(AuditAction::NodeCreated, Some((id, node.name())), None);
        }
    }

    fn record(&self, action: AuditAction, node: Option<(NodeId, &str)>, payload: Option<Value>) {
        self.process.record(Some(self.id), node, action, payload);
    }

    fn apply(self: &Arc<Self>, post: Vec<PostStep>, pool: &PoolId, follow: &mut VecDeque<Job>) {
        for step in post {
            match step {
                PostStep::Activate(id) => {
                    if let Some(job) = self.activate(id, Some(pool)) {
                        follow.push_back(job);
                    }
                }
                PostStep::Start(thread) => {
                    if let Some(job) = thread.start(Some(pool)) {
                        follow.push_back(job);
                    }
                }
                PostStep::Join { node, join } => {
                    debug!(
                        thread = %self.id,
                        node = %node,
                        timeout_millis = join.timeout_millis,
                        token = %join.token,
                        "join registered"
                    );
                    let thread = Arc::downgrade(self);
                    join.future.on_complete(move |_| {
                        let job = thread.upgrade().and_then(|t| t.resolve_join(node));
                        if let Some(job) = job {
                            job.run();
                        }
                    });
                }
                PostStep::ReleaseGrants(policy) => {
                    self.resources.lock().grants.deactivate_all(policy);
                }
                PostStep::Finish(outcome) => self.complete(outcome),
            }
        }
    }

    /// Release thread-scoped state and notify joiners and the process.
    fn complete(self: &Arc<Self>, outcome: FlowOutcome) {
        let policy = if outcome.is_completed() {
            DeactivationPolicy::Enforce
        } else {
            DeactivationPolicy::Disregard
        };
        {
            let mut resources = self.resources.lock();
            let resources = &mut *resources;
            resources.grants.deactivate_all(policy);
            resources.table.release_all();
        }
        info!(
            process = %self.process.id(),
            thread = %self.id,
            completed = outcome.is_completed(),
            "logical thread finished"
        );
        self.completion.resolve(outcome.clone());
        self.process.thread_finished(self.id, &outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_string())
}

impl fmt::Debug for LogicalThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalThread")
            .field("id", &self.id)
            .field("process", &self.process.id())
            .finish_non_exhaustive()
    }
}
