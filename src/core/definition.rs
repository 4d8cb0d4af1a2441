//! Static task metadata handed to the scheduler by the configuration layer.
//!
//! A [`TaskDefinition`] is immutable once built and shared through `Arc`. Every
//! task node created from it points back to the same definition.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context::TaskContext;
use super::error::TaskOutcome;
use super::escalation::EscalationProcedure;
use super::resources::ResourceHandle;

/// The logic run in a node's EXECUTE phase.
///
/// # Example
///
/// ```rust,ignore
/// use prometheus_flow::core::{TaskBody, TaskContext, TaskOutcome};
///
/// struct Double;
///
/// impl TaskBody for Double {
///     fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
///         let n = ctx.parameter().as_i64().unwrap_or_default();
///         TaskOutcome::success(n * 2)
///     }
/// }
/// ```
pub trait TaskBody: Send + Sync {
    /// Run the task once with the current context.
    fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome;
}

/// Adapter turning a closure into a [`TaskBody`].
pub struct TaskFn<F>(F);

impl<F> TaskFn<F>
where
    F: Fn(&mut TaskContext<'_>) -> TaskOutcome + Send + Sync + 'static,
{
    /// Wrap a closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TaskBody for TaskFn<F>
where
    F: Fn(&mut TaskContext<'_>) -> TaskOutcome + Send + Sync + 'static,
{
    fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        (self.0)(ctx)
    }
}

/// Body that succeeds immediately, passing its parameter through.
struct PassThrough;

impl TaskBody for PassThrough {
    fn execute(&self, ctx: &mut TaskContext<'_>) -> TaskOutcome {
        TaskOutcome::Success(ctx.parameter().clone())
    }
}

/// Tag describing what role a task plays in a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Ordinary task logic.
    Function,
    /// Runs as a parallel child before its owner's body executes.
    Setup,
    /// Instantiated by escalation search to handle a failure.
    EscalationHandler,
}

/// Which worker pool is responsible for running a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Responsibility {
    /// Whichever pool activates the node; the default pool from outside any pool.
    Any,
    /// A named pool. Runs inline only if the caller is already on it.
    Pool(String),
    /// Always handed off to the default pool, never continued inline.
    Decoupled,
}

/// Strategy used when a supervision grant is switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationPolicy {
    /// Keep the supervised work (e.g. commit).
    Enforce,
    /// Throw the supervised work away (e.g. roll back).
    Disregard,
}

/// Desired state of one supervision kind while a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SupervisionRequirement {
    /// Index of the supervisor in the process definition.
    pub index: usize,
    /// Whether the supervision must be active.
    pub active: bool,
}

/// Immutable metadata for one task.
pub struct TaskDefinition {
    name: String,
    kind: TaskKind,
    body: Arc<dyn TaskBody>,
    resources: Vec<ResourceHandle>,
    supervision: Vec<SupervisionRequirement>,
    next: Option<Arc<TaskDefinition>>,
    setup: Option<Arc<TaskDefinition>>,
    escalation: Option<Arc<EscalationProcedure>>,
    responsibility: Responsibility,
}

impl TaskDefinition {
    /// Start building a task definition.
    pub fn builder(name: impl Into<String>) -> TaskDefinitionBuilder {
        TaskDefinitionBuilder {
            definition: Self {
                name: name.into(),
                kind: TaskKind::Function,
                body: Arc::new(PassThrough),
                resources: Vec::new(),
                supervision: Vec::new(),
                next: None,
                setup: None,
                escalation: None,
                responsibility: Responsibility::Any,
            },
        }
    }

    /// Task name, used in logs and audit events.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role tag.
    #[must_use]
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }

    /// The logic hook.
    #[must_use]
    pub fn body(&self) -> &Arc<dyn TaskBody> {
        &self.body
    }

    /// Resource handles the task needs before EXECUTE.
    #[must_use]
    pub fn resources(&self) -> &[ResourceHandle] {
        &self.resources
    }

    /// Supervision states required before EXECUTE.
    #[must_use]
    pub fn supervision(&self) -> &[SupervisionRequirement] {
        &self.supervision
    }

    /// Statically declared next task.
    #[must_use]
    pub const fn next(&self) -> Option<&Arc<Self>> {
        self.next.as_ref()
    }

    /// Setup task run before the body.
    #[must_use]
    pub const fn setup(&self) -> Option<&Arc<Self>> {
        self.setup.as_ref()
    }

    /// Local escalation procedure.
    #[must_use]
    pub const fn escalation(&self) -> Option<&Arc<EscalationProcedure>> {
        self.escalation.as_ref()
    }

    /// Responsible pool.
    #[must_use]
    pub const fn responsibility(&self) -> &Responsibility {
        &self.responsibility
    }

    /// Whether any resource phase has work to do.
    pub(crate) fn needs_resource_phases(&self) -> bool {
        !self.resources.is_empty() || !self.supervision.is_empty()
    }

    /// Deactivation policy for nodes of this task unless a continuation overrides it.
    pub(crate) const fn default_policy(&self) -> DeactivationPolicy {
        match self.kind {
            TaskKind::EscalationHandler => DeactivationPolicy::Disregard,
            TaskKind::Function | TaskKind::Setup => DeactivationPolicy::Enforce,
        }
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("resources", &self.resources)
            .field("supervision", &self.supervision)
            .field("next", &self.next.as_ref().map(|n| n.name()))
            .field("setup", &self.setup.as_ref().map(|s| s.name()))
            .field("escalation", &self.escalation.as_ref().map(|e| e.name()))
            .field("responsibility", &self.responsibility)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TaskDefinition`].
pub struct TaskDefinitionBuilder {
    definition: TaskDefinition,
}

impl TaskDefinitionBuilder {
    /// Set the role tag.
    #[must_use]
    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.definition.kind = kind;
        self
    }

    /// Set the body.
    #[must_use]
    pub fn body(mut self, body: impl TaskBody + 'static) -> Self {
        self.definition.body = Arc::new(body);
        self
    }

    /// Set the body from a closure.
    #[must_use]
    pub fn body_fn<F>(self, f: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> TaskOutcome + Send + Sync + 'static,
    {
        self.body(TaskFn::new(f))
    }

    /// Require a resource.
    #[must_use]
    pub fn resource(mut self, handle: ResourceHandle) -> Self {
        self.definition.resources.push(handle);
        self
    }

    /// Require a supervision kind to be active (`true`) or inactive (`false`).
    #[must_use]
    pub fn supervise(mut self, index: usize, active: bool) -> Self {
        self.definition
            .supervision
            .push(SupervisionRequirement { index, active });
        self
    }

    /// Declare the static next task.
    #[must_use]
    pub fn next(mut self, next: Arc<TaskDefinition>) -> Self {
        self.definition.next = Some(next);
        self
    }

    /// Declare a setup task run before the body.
    #[must_use]
    pub fn setup(mut self, setup: Arc<TaskDefinition>) -> Self {
        self.definition.setup = Some(setup);
        self
    }

    /// Attach a local escalation procedure.
    #[must_use]
    pub fn escalation(mut self, procedure: Arc<EscalationProcedure>) -> Self {
        self.definition.escalation = Some(procedure);
        self
    }

    /// Pin the task to a named pool.
    #[must_use]
    pub fn pool(mut self, name: impl Into<String>) -> Self {
        self.definition.responsibility = Responsibility::Pool(name.into());
        self
    }

    /// Set the responsibility directly.
    #[must_use]
    pub fn responsibility(mut self, responsibility: Responsibility) -> Self {
        self.definition.responsibility = responsibility;
        self
    }

    /// Finish the definition.
    #[must_use]
    pub fn build(self) -> Arc<TaskDefinition> {
        Arc::new(self.definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = TaskDefinition::builder("a").build();
        assert_eq!(task.name(), "a");
        assert_eq!(task.kind(), TaskKind::Function);
        assert_eq!(task.responsibility(), &Responsibility::Any);
        assert!(!task.needs_resource_phases());
        assert_eq!(task.default_policy(), DeactivationPolicy::Enforce);
    }

    #[test]
    fn test_handler_defaults_to_disregard() {
        let task = TaskDefinition::builder("h")
            .kind(TaskKind::EscalationHandler)
            .build();
        assert_eq!(task.default_policy(), DeactivationPolicy::Disregard);
    }

    #[test]
    fn test_builder_links() {
        let next = TaskDefinition::builder("b").build();
        let task = TaskDefinition::builder("a")
            .next(Arc::clone(&next))
            .supervise(0, true)
            .resource(ResourceHandle::thread(1))
            .pool("io")
            .build();
        assert_eq!(task.next().map(|n| n.name()), Some("b"));
        assert!(task.needs_resource_phases());
        assert_eq!(task.responsibility(), &Responsibility::Pool("io".into()));
    }
}
