//! Tests for builder modules

use prometheus_flow::builders::{build_pool, build_pools};
use prometheus_flow::config::{PoolConfig, PoolKind, SchedulerConfig};
use prometheus_flow::core::{FlowError, PoolId};

#[test]
fn test_build_passive_pool() {
    let pool = build_pool("inline", &PoolConfig::new(PoolKind::Passive)).unwrap();
    assert_eq!(pool.id(), &PoolId::new("inline"));
    assert_eq!(pool.stats().worker_count, 0);
}

#[test]
fn test_build_threaded_pool() {
    let cfg = PoolConfig::new(PoolKind::Threaded).with_worker_count(2);
    let pool = build_pool("cpu", &cfg).unwrap();
    assert_eq!(pool.stats().worker_count, 2);
    pool.shutdown();
}

#[test]
fn test_build_pools_registers_all() {
    let cfg = SchedulerConfig::single(PoolConfig::new(PoolKind::Passive))
        .with_pool("gpu", PoolConfig::new(PoolKind::Passive));
    let registry = build_pools(&cfg).unwrap();

    let mut ids: Vec<String> = registry.ids().map(ToString::to_string).collect();
    ids.sort();
    assert_eq!(ids, vec!["default", "gpu"]);
    assert_eq!(registry.default_pool(), &PoolId::new("default"));
}

#[test]
fn test_build_pools_rejects_invalid_config() {
    let cfg = SchedulerConfig::single(PoolConfig::new(PoolKind::Threaded).with_worker_count(0));
    let err = build_pools(&cfg).unwrap_err();
    assert!(matches!(err, FlowError::InvalidConfig(_)));
}
