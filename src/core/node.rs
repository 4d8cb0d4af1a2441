//! Task nodes and execution paths, stored in a per-thread arena.
//!
//! Nodes never point at each other directly. A node names the path it sits
//! on, the chained sequential node that follows it, and the parallel paths it
//! owns; a path names its owner node. Removing a subtree is a walk over ids.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::{DeactivationPolicy, Responsibility, TaskDefinition};
use super::error::Failure;
use super::escalation::EscalationProcedure;
use super::resources::ResourceValue;

/// Identifier of a task node, unique within its logical thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PathId(u64);

/// Position of a task node in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Resolving resource handles to instances.
    LoadResources,
    /// Bringing supervision grants to their required state.
    GovernResources,
    /// Coordinating dependent resources and checking readiness.
    CoordinateResources,
    /// Running the task body.
    Execute,
    /// Waiting for parallel children, joins or an explicit resume.
    HandleCompletion,
    /// Chaining the static next task.
    ActivateNext,
    /// Finished.
    Completed,
    /// Failed and handed to escalation search.
    Failed,
}

impl NodeState {
    /// Whether the node has reached an end state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub(crate) const fn is_resource_phase(self) -> bool {
        matches!(
            self,
            Self::LoadResources | Self::GovernResources | Self::CoordinateResources
        )
    }
}

/// Everything needed to create a node.
pub(crate) struct NodeSeed {
    pub definition: Arc<TaskDefinition>,
    pub parameter: Value,
    pub cause: Option<Failure>,
    pub inherited: Option<Arc<EscalationProcedure>>,
    pub policy: Option<DeactivationPolicy>,
    pub responsibility: Option<Responsibility>,
}

impl NodeSeed {
    pub fn new(definition: Arc<TaskDefinition>, parameter: Value) -> Self {
        Self {
            definition,
            parameter,
            cause: None,
            inherited: None,
            policy: None,
            responsibility: None,
        }
    }

    pub fn inherit(mut self, procedure: Option<Arc<EscalationProcedure>>) -> Self {
        self.inherited = procedure;
        self
    }

    pub fn policy(mut self, policy: Option<DeactivationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Run on the default pool regardless of the definition's responsibility.
    pub fn decoupled(mut self) -> Self {
        self.responsibility = Some(Responsibility::Decoupled);
        self
    }
}

pub(crate) struct TaskNode {
    pub id: NodeId,
    pub path: PathId,
    pub definition: Arc<TaskDefinition>,
    pub state: NodeState,
    pub parameter: Value,
    pub result: Value,
    pub cause: Option<Failure>,
    /// Nearest applicable escalation procedure.
    pub escalation: Option<Arc<EscalationProcedure>>,
    pub policy: DeactivationPolicy,
    pub responsibility: Responsibility,
    pub queued: bool,
    pub setup_spawned: bool,
    /// Body left itself incomplete and waits for an explicit resume.
    pub suspended: bool,
    /// A resume arrived before the body reported itself incomplete.
    pub resume_pending: bool,
    /// Sequential continuation chained on the same path.
    pub next: Option<NodeId>,
    /// Parallel paths owned by this node and not yet finished.
    pub children: Vec<PathId>,
    pub pending_joins: usize,
    pub executions: u32,
    pub resources: Vec<ResourceValue>,
}

impl TaskNode {
    fn new(id: NodeId, path: PathId, seed: NodeSeed) -> Self {
        let definition = seed.definition;
        Self {
            id,
            path,
            state: NodeState::LoadResources,
            parameter: seed.parameter,
            result: Value::Null,
            cause: seed.cause,
            escalation: definition.escalation().cloned().or(seed.inherited),
            policy: seed.policy.unwrap_or_else(|| definition.default_policy()),
            responsibility: seed
                .responsibility
                .unwrap_or_else(|| definition.responsibility().clone()),
            queued: false,
            setup_spawned: false,
            suspended: false,
            resume_pending: false,
            next: None,
            children: Vec::new(),
            pending_joins: 0,
            executions: 0,
            resources: Vec::new(),
            definition,
        }
    }

    /// Parallel children or joins still outstanding.
    pub fn is_waiting(&self) -> bool {
        !self.children.is_empty() || self.pending_joins > 0
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }
}

/// An ordered chain of nodes sharing one completion signal.
pub(crate) struct ExecutionPath {
    pub owner: Option<NodeId>,
    pub current: NodeId,
    /// Procedure whose match created this path as a handler.
    pub handler_for: Option<Arc<EscalationProcedure>>,
}

/// What follows a retired node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retired {
    /// The path continues with this node.
    Next(NodeId),
    /// The path is finished; `owner` is `None` for a root path.
    PathDone { owner: Option<NodeId> },
}

/// Arena of the nodes and paths of one logical thread.
#[derive(Default)]
pub(crate) struct FlowTree {
    nodes: HashMap<NodeId, TaskNode>,
    paths: HashMap<PathId, ExecutionPath>,
    next_node: u64,
    next_path: u64,
}

impl FlowTree {
    pub fn node(&self, id: NodeId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(&id)
    }

    pub fn path(&self, id: PathId) -> Option<&ExecutionPath> {
        self.paths.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn insert(&mut self, path: PathId, seed: NodeSeed) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        self.nodes.insert(id, TaskNode::new(id, path, seed));
        id
    }

    /// Create a path whose first node is built from `seed`, owned by `owner`
    /// (or a root path when `None`).
    pub fn open_path(
        &mut self,
        owner: Option<NodeId>,
        seed: NodeSeed,
        handler_for: Option<Arc<EscalationProcedure>>,
    ) -> NodeId {
        self.next_path += 1;
        let path = PathId(self.next_path);
        let node = self.insert(path, seed);
        self.attach(path, owner, node, handler_for);
        node
    }

    fn attach(
        &mut self,
        path: PathId,
        owner: Option<NodeId>,
        current: NodeId,
        handler_for: Option<Arc<EscalationProcedure>>,
    ) {
        self.paths.insert(
            path,
            ExecutionPath {
                owner,
                current,
                handler_for,
            },
        );
        if let Some(owner) = owner.and_then(|o| self.nodes.get_mut(&o)) {
            owner.children.push(path);
        }
    }

    /// Chain a sequential continuation after `node` on the same path.
    pub fn chain(&mut self, node: NodeId, seed: NodeSeed) -> Option<NodeId> {
        let path = self.nodes.get(&node)?.path;
        let next = self.insert(path, seed);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.next = Some(next);
        }
        Some(next)
    }

    /// Move the sequential continuation pending after `node` onto its own
    /// parallel path owned by `node`.
    pub fn convert_next_to_parallel(&mut self, node: NodeId) -> Option<NodeId> {
        let next = self.nodes.get_mut(&node)?.next.take()?;
        self.next_path += 1;
        let path = PathId(self.next_path);
        if let Some(n) = self.nodes.get_mut(&next) {
            n.path = path;
        }
        self.attach(path, Some(node), next, None);
        Some(next)
    }

    /// Drop a completed node, advancing its path to the chained continuation.
    pub fn retire(&mut self, id: NodeId) -> Retired {
        let Some(node) = self.nodes.remove(&id) else {
            return Retired::PathDone { owner: None };
        };
        if let Some(next) = node.next {
            if let Some(path) = self.paths.get_mut(&node.path) {
                path.current = next;
            }
            return Retired::Next(next);
        }
        let Some(path) = self.paths.remove(&node.path) else {
            return Retired::PathDone { owner: None };
        };
        if let Some(owner) = path.owner.and_then(|o| self.nodes.get_mut(&o)) {
            owner.children.retain(|c| *c != node.path);
        }
        Retired::PathDone { owner: path.owner }
    }

    /// Remove a path with everything chained on it and every path below it.
    pub fn clear_path(&mut self, path: PathId, cleared: &mut Vec<TaskNode>) {
        let Some(removed) = self.paths.remove(&path) else {
            return;
        };
        if let Some(owner) = removed.owner.and_then(|o| self.nodes.get_mut(&o)) {
            owner.children.retain(|c| *c != path);
        }
        let mut cursor = Some(removed.current);
        while let Some(id) = cursor {
            let Some(node) = self.nodes.remove(&id) else {
                break;
            };
            for child in &node.children {
                self.clear_path(*child, cleared);
            }
            cursor = node.next;
            cleared.push(node);
        }
    }

    /// Remove everything.
    pub fn clear_all(&mut self, cleared: &mut Vec<TaskNode>) {
        let roots: Vec<PathId> = self
            .paths
            .iter()
            .filter(|(_, p)| p.owner.is_none())
            .map(|(id, _)| *id)
            .collect();
        for root in roots {
            self.clear_path(root, cleared);
        }
        cleared.extend(self.nodes.drain().map(|(_, node)| node));
        self.paths.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(name: &str) -> NodeSeed {
        NodeSeed::new(TaskDefinition::builder(name).build(), Value::Null)
    }

    #[test]
    fn test_chain_and_retire() {
        let mut tree = FlowTree::default();
        let a = tree.open_path(None, seed("a"), None);
        let b = tree.chain(a, seed("b")).unwrap();

        assert_eq!(tree.retire(a), Retired::Next(b));
        assert_eq!(tree.retire(b), Retired::PathDone { owner: None });
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn test_parallel_child_retire_returns_owner() {
        let mut tree = FlowTree::default();
        let a = tree.open_path(None, seed("a"), None);
        let p = tree.open_path(Some(a), seed("p"), None);
        assert!(tree.node(a).unwrap().is_waiting());

        assert_eq!(tree.retire(p), Retired::PathDone { owner: Some(a) });
        assert!(!tree.node(a).unwrap().is_waiting());
    }

    #[test]
    fn test_convert_next_to_parallel() {
        let mut tree = FlowTree::default();
        let a = tree.open_path(None, seed("a"), None);
        let b = tree.chain(a, seed("b")).unwrap();

        assert_eq!(tree.convert_next_to_parallel(a), Some(b));
        let node_a = tree.node(a).unwrap();
        assert!(node_a.next.is_none());
        assert_eq!(node_a.children.len(), 1);
        let path = tree.path(tree.node(b).unwrap().path).unwrap();
        assert_eq!(path.owner, Some(a));
    }

    #[test]
    fn test_clear_path_removes_subtree() {
        let mut tree = FlowTree::default();
        let a = tree.open_path(None, seed("a"), None);
        let b = tree.open_path(Some(a), seed("b"), None);
        tree.chain(b, seed("c")).unwrap();
        tree.open_path(Some(b), seed("d"), None);

        let path = tree.node(b).unwrap().path;
        let mut cleared = Vec::new();
        tree.clear_path(path, &mut cleared);

        let mut names: Vec<_> = cleared.iter().map(|n| n.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["b", "c", "d"]);
        assert_eq!(tree.len(), 1);
        assert!(!tree.node(a).unwrap().is_waiting());
    }

    #[test]
    fn test_inherits_escalation_unless_own() {
        let procedure = EscalationProcedure::new("p").build();
        let mut tree = FlowTree::default();
        let a = tree.open_path(None, seed("a").inherit(Some(Arc::clone(&procedure))), None);
        let node = tree.node(a).unwrap();
        assert!(node.escalation.as_ref().is_some_and(|e| Arc::ptr_eq(e, &procedure)));
        assert_eq!(node.state, NodeState::LoadResources);
        assert_eq!(node.policy, DeactivationPolicy::Enforce);
    }
}
