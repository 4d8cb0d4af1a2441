//! Resource container: loads, supervises and coordinates the shared resources a
//! task node needs, without ever blocking the worker running the node.
//!
//! Unreadiness is reported, not waited on. Every wait registers the node on a
//! [`Readiness`] signal and the node's step returns "still pending"; whoever
//! completes the signal re-activates the node.

use std::any::Any;
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::definition::{DeactivationPolicy, SupervisionRequirement};
use super::error::Failure;
use super::supervision::SupervisionGrants;
use super::thread::Wakeup;

/// A loaded resource instance, shared by every node that uses it.
pub type ResourceValue = Arc<dyn Any + Send + Sync>;

/// Dependency chains deeper than this are treated as a cycle.
const MAX_DEPENDENCY_DEPTH: usize = 64;

/// Table a resource handle indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceScope {
    /// Shared by every logical thread of a process.
    Process,
    /// Private to one logical thread.
    Thread,
}

/// Index into a process- or thread-scoped resource table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    /// Which table.
    pub scope: ResourceScope,
    /// Position in the table.
    pub index: usize,
}

impl ResourceHandle {
    /// Handle to a process-scoped resource.
    #[must_use]
    pub const fn process(index: usize) -> Self {
        Self {
            scope: ResourceScope::Process,
            index,
        }
    }

    /// Handle to a thread-scoped resource.
    #[must_use]
    pub const fn thread(index: usize) -> Self {
        Self {
            scope: ResourceScope::Thread,
            index,
        }
    }
}

/// Result of starting to load a resource.
pub enum Loaded {
    /// Usable immediately.
    Ready(ResourceValue),
    /// Created, but usable only once `readiness` completes.
    Pending {
        /// The instance.
        value: ResourceValue,
        /// Completed by whoever finishes the asynchronous setup.
        readiness: Readiness,
    },
}

/// Produces and manages one kind of resource.
///
/// `load` and `coordinate` run while the process resource-coordination lock is
/// held. A [`Readiness`] they hand out must be completed from elsewhere, never
/// from inside the callback.
pub trait ResourceSource: Send + Sync {
    /// Create the instance. Called at most once per scope.
    ///
    /// # Errors
    ///
    /// A failure here fails the node that needed the resource.
    fn load(&self) -> Result<Loaded, Failure>;

    /// Make the instance consistent with its (ready) dependencies. Called once,
    /// after every dependency is ready.
    ///
    /// # Errors
    ///
    /// A failure here fails the node that needed the resource.
    fn coordinate(&self, _value: &ResourceValue, _dependencies: &[ResourceValue]) -> Result<(), Failure> {
        Ok(())
    }

    /// Dispose of the instance when its scope finishes.
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored.
    fn release(&self, _value: &ResourceValue) -> Result<(), Failure> {
        Ok(())
    }
}

/// Declaration of one resource in a process or thread table.
#[derive(Clone)]
pub struct ResourceDefinition {
    name: String,
    source: Arc<dyn ResourceSource>,
    dependencies: Vec<ResourceHandle>,
}

impl ResourceDefinition {
    /// Declare a resource.
    pub fn new(name: impl Into<String>, source: Arc<dyn ResourceSource>) -> Self {
        Self {
            name: name.into(),
            source,
            dependencies: Vec::new(),
        }
    }

    /// Declare a resource that must be ready (and coordinated with) first.
    #[must_use]
    pub fn depends_on(mut self, handle: ResourceHandle) -> Self {
        self.dependencies.push(handle);
        self
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[ResourceHandle] {
        &self.dependencies
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

enum ReadinessState {
    Pending(Vec<Wakeup>),
    Ready,
    Failed(Failure),
}

/// Observed state of a [`Readiness`] signal.
#[derive(Debug)]
pub(crate) enum Poll {
    Ready,
    Pending,
    Failed(Failure),
}

/// One-shot readiness signal carrying the set of nodes waiting on it.
///
/// Cloning yields another handle to the same signal.
#[derive(Clone)]
pub struct Readiness {
    state: Arc<Mutex<ReadinessState>>,
}

impl Readiness {
    /// A signal that has not fired yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReadinessState::Pending(Vec::new()))),
        }
    }

    /// A signal that has already fired.
    #[must_use]
    pub fn ready() -> Self {
        Self {
            state: Arc::new(Mutex::new(ReadinessState::Ready)),
        }
    }

    /// Whether the signal completed successfully.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), ReadinessState::Ready)
    }

    /// Mark ready and re-activate every waiting node. Later calls are no-ops.
    pub fn complete(&self) {
        let waiters = {
            let mut state = self.state.lock();
            let ReadinessState::Pending(waiters) = &mut *state else {
                return;
            };
            let waiters = mem::take(waiters);
            *state = ReadinessState::Ready;
            waiters
        };
        debug!(waiters = waiters.len(), "readiness completed");
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Mark failed and re-activate every waiting node so it observes the failure.
    pub fn fail(&self, failure: Failure) {
        let waiters = {
            let mut state = self.state.lock();
            let ReadinessState::Pending(waiters) = &mut *state else {
                return;
            };
            let waiters = mem::take(waiters);
            *state = ReadinessState::Failed(failure);
            waiters
        };
        warn!(waiters = waiters.len(), "readiness failed");
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Check the signal, registering `waiter` if it has not fired yet.
    pub(crate) fn poll(&self, waiter: &Wakeup) -> Poll {
        let mut state = self.state.lock();
        match &mut *state {
            ReadinessState::Pending(waiters) => {
                if !waiters.iter().any(|w| w.same_target(waiter)) {
                    waiters.push(waiter.clone());
                }
                Poll::Pending
            }
            ReadinessState::Ready => Poll::Ready,
            ReadinessState::Failed(failure) => Poll::Failed(failure.clone()),
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            ReadinessState::Pending(w) => format!("pending({})", w.len()),
            ReadinessState::Ready => "ready".to_string(),
            ReadinessState::Failed(failure) => format!("failed({failure})"),
        };
        f.debug_struct("Readiness").field("state", &state).finish()
    }
}

struct ResourceInstance {
    value: ResourceValue,
    readiness: Readiness,
}

impl From<Loaded> for ResourceInstance {
    fn from(loaded: Loaded) -> Self {
        match loaded {
            Loaded::Ready(value) => Self {
                value,
                readiness: Readiness::ready(),
            },
            Loaded::Pending { value, readiness } => Self { value, readiness },
        }
    }
}

#[derive(Default)]
struct ResourceSlot {
    instance: Option<ResourceInstance>,
    coordinated: bool,
}

/// Loaded instances for one scope, indexed like its definitions.
pub(crate) struct ResourceTable {
    scope: ResourceScope,
    definitions: Arc<[ResourceDefinition]>,
    slots: Vec<ResourceSlot>,
}

impl ResourceTable {
    pub fn new(scope: ResourceScope, definitions: Arc<[ResourceDefinition]>) -> Self {
        let slots = definitions.iter().map(|_| ResourceSlot::default()).collect();
        Self {
            scope,
            definitions,
            slots,
        }
    }

    fn definition(&self, index: usize) -> Result<&ResourceDefinition, Failure> {
        self.definitions.get(index).ok_or_else(|| {
            Failure::new(
                "resource.unknown",
                format!("no {:?} resource at index {index}", self.scope),
            )
        })
    }

    /// Number of instances currently loaded.
    #[cfg(test)]
    pub fn loaded(&self) -> usize {
        self.slots.iter().filter(|s| s.instance.is_some()).count()
    }

    /// Release every loaded instance, most recently declared first.
    pub fn release_all(&mut self) -> Vec<Failure> {
        let mut failures = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            slot.coordinated = false;
            let Some(instance) = slot.instance.take() else {
                continue;
            };
            let definition = &self.definitions[index];
            if let Err(failure) = definition.source.release(&instance.value) {
                warn!(resource = definition.name(), %failure, "resource release failed");
                failures.push(failure);
            }
        }
        failures
    }
}

/// Borrowed view over the tables and grants a node's resource phases touch.
///
/// The process table is only present while the process resource-coordination
/// lock is held.
pub(crate) struct ResourceContainer<'a> {
    process: Option<&'a mut ResourceTable>,
    thread: &'a mut ResourceTable,
    grants: &'a mut SupervisionGrants,
}

impl<'a> ResourceContainer<'a> {
    pub fn new(
        process: Option<&'a mut ResourceTable>,
        thread: &'a mut ResourceTable,
        grants: &'a mut SupervisionGrants,
    ) -> Self {
        Self {
            process,
            thread,
            grants,
        }
    }

    fn table(&mut self, scope: ResourceScope) -> Result<&mut ResourceTable, Failure> {
        match scope {
            ResourceScope::Thread => Ok(&mut *self.thread),
            ResourceScope::Process => self.process.as_deref_mut().ok_or_else(|| {
                Failure::new(
                    "resource.unavailable",
                    "process resources accessed without the coordination lock",
                )
            }),
        }
    }

    fn instance(&mut self, handle: ResourceHandle) -> Result<&ResourceInstance, Failure> {
        let table = self.table(handle.scope)?;
        let name = table.definition(handle.index)?.name.clone();
        table.slots[handle.index].instance.as_ref().ok_or_else(|| {
            Failure::new("resource.unavailable", format!("resource `{name}` is not loaded"))
        })
    }

    /// Resolve handles (and their dependencies) to instances. Loads each
    /// instance at most once per scope.
    pub fn load_resources(&mut self, handles: &[ResourceHandle]) -> Result<(), Failure> {
        for handle in handles {
            self.load_one(*handle, 0)?;
        }
        Ok(())
    }

    fn load_one(&mut self, handle: ResourceHandle, depth: usize) -> Result<(), Failure> {
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(Failure::new(
                "resource.cycle",
                format!("resource dependency chain too deep at {handle:?}"),
            ));
        }
        let (source, dependencies, name) = {
            let table = self.table(handle.scope)?;
            let definition = table.definition(handle.index)?;
            if table.slots[handle.index].instance.is_some() {
                return Ok(());
            }
            (
                Arc::clone(&definition.source),
                definition.dependencies.clone(),
                definition.name.clone(),
            )
        };
        for dependency in dependencies {
            self.load_one(dependency, depth + 1)?;
        }
        let instance = ResourceInstance::from(source.load()?);
        debug!(resource = %name, scope = ?handle.scope, "resource loaded");
        self.table(handle.scope)?.slots[handle.index].instance = Some(instance);
        Ok(())
    }

    /// Toggle every supervision whose current state differs from the required
    /// one. Returns `false` while a toggle is still in flight.
    pub fn govern_resources(
        &mut self,
        requirements: &[SupervisionRequirement],
        policy: DeactivationPolicy,
        handles: &[ResourceHandle],
        waiter: &Wakeup,
    ) -> Result<bool, Failure> {
        if requirements.is_empty() {
            return Ok(true);
        }
        let values = self.values(handles)?;
        for requirement in requirements {
            if !self
                .grants
                .toggle(requirement.index, requirement.active, policy, &values, waiter)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run pairwise coordination for every handle whose dependencies are ready.
    /// Safe to repeat; each instance is coordinated once.
    pub fn coordinate_resources(
        &mut self,
        handles: &[ResourceHandle],
        waiter: &Wakeup,
    ) -> Result<bool, Failure> {
        let mut coordinated = true;
        for handle in handles {
            if !self.coordinate_one(*handle, waiter, 0)? {
                coordinated = false;
            }
        }
        Ok(coordinated)
    }

    fn coordinate_one(
        &mut self,
        handle: ResourceHandle,
        waiter: &Wakeup,
        depth: usize,
    ) -> Result<bool, Failure> {
        if depth > MAX_DEPENDENCY_DEPTH {
            return Err(Failure::new(
                "resource.cycle",
                format!("resource dependency chain too deep at {handle:?}"),
            ));
        }
        let (source, dependencies) = {
            let table = self.table(handle.scope)?;
            let definition = table.definition(handle.index)?;
            if table.slots[handle.index].coordinated {
                return Ok(true);
            }
            (Arc::clone(&definition.source), definition.dependencies.clone())
        };
        let mut values = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            if !self.coordinate_one(dependency, waiter, depth + 1)? {
                return Ok(false);
            }
            let instance = self.instance(dependency)?;
            match instance.readiness.poll(waiter) {
                Poll::Ready => values.push(Arc::clone(&instance.value)),
                Poll::Pending => return Ok(false),
                Poll::Failed(failure) => return Err(failure),
            }
        }
        if !values.is_empty() {
            let value = Arc::clone(&self.instance(handle)?.value);
            source.coordinate(&value, &values)?;
        }
        self.table(handle.scope)?.slots[handle.index].coordinated = true;
        Ok(true)
    }

    /// Whether every handle's instance is ready. Registers `waiter` on each one
    /// that is not.
    pub fn resources_ready(
        &mut self,
        handles: &[ResourceHandle],
        waiter: &Wakeup,
    ) -> Result<bool, Failure> {
        let mut ready = true;
        for handle in handles {
            match self.instance(*handle)?.readiness.poll(waiter) {
                Poll::Ready => {}
                Poll::Pending => ready = false,
                Poll::Failed(failure) => return Err(failure),
            }
        }
        Ok(ready)
    }

    /// Instances for `handles`, in order.
    pub fn values(&mut self, handles: &[ResourceHandle]) -> Result<Vec<ResourceValue>, Failure> {
        handles
            .iter()
            .map(|handle| self.instance(*handle).map(|i| Arc::clone(&i.value)))
            .collect()
    }
}
