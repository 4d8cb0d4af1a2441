//! Audit sink implementations.
//!
//! Records process, thread and node lifecycle events. The scheduler shares one
//! sink across every worker, so sinks take `&self` and synchronize internally.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::util::clock::now_ms;

/// Lifecycle action recorded by an [`AuditEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A process was invoked.
    ProcessStarted,
    /// A logical thread was created.
    ThreadStarted,
    /// A task node was created.
    NodeCreated,
    /// A task node completed.
    NodeCompleted,
    /// A task node was removed by escalation or thread failure.
    NodeCleared,
    /// A task node failed.
    NodeFailed,
    /// A failure was routed to a handler; the payload lists the scopes visited.
    Escalated,
    /// A failure went unhandled or was framework-fatal.
    FatalFailure,
    /// A logical thread finished.
    ThreadCompleted,
    /// A process finished.
    ProcessCompleted,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProcessStarted => "process_started",
            Self::ThreadStarted => "thread_started",
            Self::NodeCreated => "node_created",
            Self::NodeCompleted => "node_completed",
            Self::NodeCleared => "node_cleared",
            Self::NodeFailed => "node_failed",
            Self::Escalated => "escalated",
            Self::FatalFailure => "fatal_failure",
            Self::ThreadCompleted => "thread_completed",
            Self::ProcessCompleted => "process_completed",
        };
        f.write_str(name)
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event identifier.
    pub event_id: String,
    /// Process identifier.
    pub process: u64,
    /// Logical thread identifier, if the event concerns one.
    pub thread: Option<u64>,
    /// Node identifier, if the event concerns one.
    pub node: Option<u64>,
    /// Task name, if the event concerns a node.
    pub task: Option<String>,
    /// Action taken.
    pub action: AuditAction,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
    /// Additional context.
    pub payload: Option<Value>,
}

/// Audit sink abstraction.
pub trait AuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
///
/// Clones share the same buffer, so a test can keep one clone and hand the
/// other to the scheduler.
#[derive(Clone)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events with the given action.
    #[must_use]
    pub fn events_for(&self, action: AuditAction) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        let mut events = self.events.lock();
        if self.max_events == 0 {
            return;
        }
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Sink that drops everything. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Helper to build an audit event with a fresh id and the current time.
#[must_use]
pub fn build_audit_event(
    process: u64,
    thread: Option<u64>,
    node: Option<u64>,
    task: Option<&str>,
    action: AuditAction,
    payload: Option<Value>,
) -> AuditEvent {
    AuditEvent {
        event_id: Uuid::new_v4().to_string(),
        process,
        thread,
        node,
        task: task.filter(|t| !t.is_empty()).map(str::to_string),
        action,
        created_at_ms: now_ms(),
        payload,
    }
}
