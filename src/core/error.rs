//! Error and outcome types for the flow scheduler.
//!
//! Two families are kept apart on purpose:
//!
//! - [`FlowError`] covers the scheduler's own machinery (pools, configuration,
//!   waiting). These are returned to the host as `Result` errors.
//! - [`Failure`] is an application-level failure raised by task logic. Failures
//!   are routed through escalation search and never surface as a `FlowError`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum FlowError {
    /// No pool is registered under the given name.
    #[error("unknown worker pool: {0}")]
    UnknownPool(String),
    /// The pool no longer accepts work.
    #[error("worker pool `{0}` has been shut down")]
    PoolShutdown(String),
    /// The pool queue is full.
    #[error("worker pool `{0}` queue is full")]
    QueueFull(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A wait did not finish within its timeout.
    #[error("operation timed out")]
    Timeout,
    /// The operation exists in the interface but is not supported.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Internal error (worker thread panic, runtime unavailable, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

/// Hierarchical failure classification, written as a dotted path.
///
/// An escalation entry for `io` catches `io`, `io.timeout` and
/// `io.timeout.read`, but not `iox`. The wildcard `*` catches everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureKind(String);

impl FailureKind {
    /// Wildcard kind matching every failure.
    pub const ANY: &'static str = "*";

    /// Create a failure kind from its dotted name.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The catch-all kind.
    #[must_use]
    pub fn any() -> Self {
        Self(Self::ANY.to_string())
    }

    /// The dotted name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an escalation entry for `self` catches a failure of kind `raised`.
    #[must_use]
    pub fn catches(&self, raised: &Self) -> bool {
        if self.0 == Self::ANY || self.0 == raised.0 {
            return true;
        }
        raised
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FailureKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// An application-level failure raised by task logic or a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct Failure {
    /// Classification used for escalation matching.
    pub kind: FailureKind,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail handed to escalation handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Failure {
    /// Kind used for failures converted from `anyhow` errors.
    pub const GENERIC: &'static str = "error";
    /// Kind used when the framework itself gives up on a thread.
    pub const FATAL: &'static str = "framework.fatal";

    /// Create a failure.
    pub fn new(kind: impl Into<FailureKind>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Failure recorded when a task reports a framework-fatal error.
    #[must_use]
    pub fn fatal(error: &FlowError) -> Self {
        Self::new(Self::FATAL, error.to_string())
    }
}

impl From<String> for FailureKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(Self::GENERIC, format!("{error:#}"))
    }
}

/// Result of running a task body once.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The body finished; the value feeds the next continuation.
    Success(Value),
    /// The body failed; the failure is routed through escalation.
    ApplicationFailure(Failure),
    /// The body hit an unrecoverable framework problem. No escalation is tried.
    FrameworkFatal(FlowError),
}

impl TaskOutcome {
    /// Success without a value.
    #[must_use]
    pub const fn done() -> Self {
        Self::Success(Value::Null)
    }

    /// Success carrying a value.
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Success(value.into())
    }

    /// Application failure of the given kind.
    pub fn fail(kind: impl Into<FailureKind>, message: impl Into<String>) -> Self {
        Self::ApplicationFailure(Failure::new(kind, message))
    }
}

impl From<Result<Value, Failure>> for TaskOutcome {
    fn from(result: Result<Value, Failure>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(failure) => Self::ApplicationFailure(failure),
        }
    }
}

/// Final outcome of a logical thread or a whole process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowOutcome {
    /// Completed, possibly through an escalation handler. Carries the last result.
    Completed(Value),
    /// Ended by an unhandled or fatal failure.
    Failed(Failure),
}

impl FlowOutcome {
    /// Whether the flow completed without an unrecovered failure.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_catches_itself_and_children() {
        let io = FailureKind::new("io");
        assert!(io.catches(&FailureKind::new("io")));
        assert!(io.catches(&FailureKind::new("io.timeout")));
        assert!(io.catches(&FailureKind::new("io.timeout.read")));
        assert!(!io.catches(&FailureKind::new("iox")));
        assert!(!io.catches(&FailureKind::new("net.io")));
    }

    #[test]
    fn test_wildcard_catches_everything() {
        let any = FailureKind::any();
        assert!(any.catches(&FailureKind::new("io")));
        assert!(any.catches(&FailureKind::new(Failure::FATAL)));
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure::new("db.conflict", "row locked");
        assert_eq!(failure.to_string(), "db.conflict: row locked");
    }

    #[test]
    fn test_failure_from_anyhow() {
        let failure: Failure = anyhow::anyhow!("disk gone").into();
        assert_eq!(failure.kind.as_str(), Failure::GENERIC);
        assert_eq!(failure.message, "disk gone");
    }

    #[test]
    fn test_flow_error_display() {
        assert_eq!(
            FlowError::Unsupported("cancel").to_string(),
            "unsupported operation: cancel"
        );
        assert_eq!(FlowError::Timeout.to_string(), "operation timed out");
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: TaskOutcome = Ok(serde_json::json!(3)).into();
        assert!(matches!(ok, TaskOutcome::Success(v) if v == 3));
        let err: TaskOutcome = Err(Failure::new("x", "y")).into();
        assert!(matches!(err, TaskOutcome::ApplicationFailure(f) if f.kind.as_str() == "x"));
    }
}
