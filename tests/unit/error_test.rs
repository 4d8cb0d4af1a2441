//! Tests for error types

use prometheus_flow::core::{Failure, FailureKind, FlowError, FlowOutcome, TaskOutcome};
use serde_json::json;

#[test]
fn test_queue_full_error() {
    let err = FlowError::QueueFull("test_pool".to_string());
    assert_eq!(format!("{err}"), "worker pool `test_pool` queue is full");
}

#[test]
fn test_unknown_pool_error() {
    let err = FlowError::UnknownPool("gpu".to_string());
    assert_eq!(format!("{err}"), "unknown worker pool: gpu");
}

#[test]
fn test_unsupported_error() {
    let err = FlowError::Unsupported("cancel");
    assert_eq!(format!("{err}"), "unsupported operation: cancel");
}

#[test]
fn test_failure_kind_hierarchy() {
    let io = FailureKind::new("io");
    assert!(io.catches(&FailureKind::new("io.timeout.read")));
    assert!(!io.catches(&FailureKind::new("iox")));
    assert!(FailureKind::any().catches(&FailureKind::new("anything")));
}

#[test]
fn test_failure_serializes_for_handlers() {
    let failure = Failure::new("io.timeout", "slow disk").with_detail(json!({ "ms": 500 }));
    let value = serde_json::to_value(&failure).unwrap();
    assert_eq!(value["kind"], "io.timeout");
    assert_eq!(value["message"], "slow disk");
    assert_eq!(value["detail"]["ms"], 500);
}

#[test]
fn test_task_outcome_helpers() {
    assert!(matches!(TaskOutcome::done(), TaskOutcome::Success(serde_json::Value::Null)));
    match TaskOutcome::fail("db", "down") {
        TaskOutcome::ApplicationFailure(f) => assert_eq!(f.kind.as_str(), "db"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_flow_outcome_serialization() {
    let outcome = FlowOutcome::Completed(json!(3));
    assert!(outcome.is_completed());
    assert_eq!(serde_json::to_value(&outcome).unwrap(), json!({ "completed": 3 }));
}
