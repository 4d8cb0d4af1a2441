//! Tests for audit sink

use prometheus_flow::core::{build_audit_event, AuditAction, AuditSink, InMemoryAuditSink};
use serde_json::json;

#[test]
fn test_in_memory_audit_sink() {
    let sink = InMemoryAuditSink::new(10);

    let event = build_audit_event(
        1,
        Some(2),
        Some(3),
        Some("load"),
        AuditAction::NodeCreated,
        Some(json!({ "k": "v" })),
    );

    sink.record(event.clone());
    assert_eq!(sink.events().len(), 1);

    let events = sink.events();
    assert_eq!(events[0], event);
    assert_eq!(events[0].task.as_deref(), Some("load"));
    assert_eq!(events[0].action, AuditAction::NodeCreated);
}

#[test]
fn test_audit_sink_overflow() {
    let sink = InMemoryAuditSink::new(2);

    sink.record(build_audit_event(1, None, None, None, AuditAction::ProcessStarted, None));
    sink.record(build_audit_event(2, None, None, None, AuditAction::ProcessStarted, None));
    sink.record(build_audit_event(3, None, None, None, AuditAction::ProcessStarted, None));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].process, 2); // First one popped
    assert_eq!(events[1].process, 3);
}

#[test]
fn test_clones_share_buffer() {
    let sink = InMemoryAuditSink::new(8);
    let other = sink.clone();
    other.record(build_audit_event(1, Some(1), None, None, AuditAction::ThreadStarted, None));
    other.record(build_audit_event(1, Some(1), None, None, AuditAction::ThreadCompleted, None));

    assert_eq!(sink.events().len(), 2);
    assert_eq!(sink.events_for(AuditAction::ThreadCompleted).len(), 1);
}

#[test]
fn test_build_audit_event() {
    let event = build_audit_event(7, Some(1), Some(4), Some(""), AuditAction::Escalated, None);

    assert_eq!(event.process, 7);
    assert_eq!(event.thread, Some(1));
    assert_eq!(event.node, Some(4));
    assert_eq!(event.task, None);
    assert_eq!(event.action.to_string(), "escalated");
    assert!(uuid::Uuid::parse_str(&event.event_id).is_ok());
    assert!(event.created_at_ms > 0);
}

#[test]
fn test_action_serializes_snake_case() {
    let value = serde_json::to_value(AuditAction::FatalFailure).unwrap();
    assert_eq!(value, json!("fatal_failure"));
}
