//! Tests for configuration validation

use prometheus_flow::config::{PoolConfig, PoolKind, SchedulerConfig, DEFAULT_POOL_NAME};

#[test]
fn test_pool_config_validation() {
    let valid = PoolConfig::new(PoolKind::Threaded)
        .with_worker_count(4)
        .with_max_queue_depth(50);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let invalid = PoolConfig::new(PoolKind::Threaded).with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_queue_depth() {
    let invalid = PoolConfig::new(PoolKind::Tokio).with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    let invalid = PoolConfig::new(PoolKind::Threaded).with_thread_stack_size(1024);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_passive_pool_ignores_sizes() {
    let passive = PoolConfig::new(PoolKind::Passive)
        .with_worker_count(0)
        .with_max_queue_depth(0);
    assert!(passive.validate().is_ok());
}

#[test]
fn test_scheduler_config_default() {
    let config = SchedulerConfig::default();
    assert_eq!(config.default_pool, DEFAULT_POOL_NAME);
    assert!(config.validate().is_ok());
}

#[test]
fn test_scheduler_config_missing_default_pool() {
    let mut config = SchedulerConfig::single(PoolConfig::new(PoolKind::Passive));
    config.default_pool = "elsewhere".into();
    let err = config.validate().unwrap_err();
    assert!(err.contains("elsewhere"));
}

#[test]
fn test_scheduler_config_empty_pools() {
    let config = SchedulerConfig {
        default_pool: DEFAULT_POOL_NAME.into(),
        pools: std::collections::HashMap::new(),
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "default_pool": "main",
        "pools": {
            "main": { "kind": "threaded", "worker_count": 2, "max_queue_depth": 64 },
            "inline": { "kind": "passive" }
        }
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(config.pools.len(), 2);
    assert_eq!(config.pools["main"].worker_count, 2);
    assert_eq!(config.pools["inline"].kind, PoolKind::Passive);
}

#[test]
fn test_scheduler_config_from_json_invalid() {
    let json = r#"{ "default_pool": "main", "pools": { "main": { "kind": "fibers" } } }"#;
    let err = SchedulerConfig::from_json_str(json).unwrap_err();
    assert!(err.starts_with("parse error"));

    let json = r#"{ "default_pool": "main", "pools": { "main": { "worker_count": 0 } } }"#;
    let err = SchedulerConfig::from_json_str(json).unwrap_err();
    assert!(err.contains("worker_count"));
}
