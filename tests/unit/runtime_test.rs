//! Tests for the tokio worker pool

#![cfg(feature = "tokio-runtime")]

use std::time::Duration;

use prometheus_flow::core::{
    FlowOutcome, Invocation, PoolId, PoolRegistry, ProcessDefinition, Scheduler, TaskDefinition,
    TaskOutcome, WorkerPool,
};
use prometheus_flow::runtime::TokioPool;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_pool_runs_flow() {
    let pool = TokioPool::new("tokio", tokio::runtime::Handle::current());
    let scheduler = Scheduler::builder()
        .pools(PoolRegistry::new(std::sync::Arc::new(pool)))
        .build();

    let second = TaskDefinition::builder("second")
        .body_fn(|ctx| TaskOutcome::success(ctx.parameter().as_i64().unwrap_or(0) + 1))
        .build();
    let first = TaskDefinition::builder("first")
        .body_fn(|ctx| TaskOutcome::success(ctx.parameter().as_i64().unwrap_or(0) * 10))
        .next(second)
        .build();

    let process = ProcessDefinition::builder("tokio-flow").build();
    let handle = scheduler.invoke(&process, Invocation::new(first).parameter(4));
    let outcome = handle.wait_async(Duration::from_secs(5)).await.unwrap();
    assert_eq!(outcome, FlowOutcome::Completed(json!(41)));

    let stats = scheduler.pool_stats();
    let tokio_stats = &stats[&PoolId::new("tokio")];
    assert!(tokio_stats.submitted_jobs >= 1);
}

#[test]
fn test_tokio_pool_owned_runtime_shutdown() {
    let pool = TokioPool::with_worker_threads("owned", 1).unwrap();
    assert_eq!(pool.stats().worker_count, 1);
    pool.shutdown();
    pool.shutdown();
}
