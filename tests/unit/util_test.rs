//! Tests for utility functions

use prometheus_flow::util::{init_tracing, now_ms};

#[test]
fn test_now_ms_is_monotonic_enough() {
    let first = now_ms();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = now_ms();
    assert!(second >= first);
    assert!(first > 1_600_000_000_000);
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    tracing::info!("tracing initialized twice without panicking");
}
