//! Integration tests for worker pools
//!
//! These tests validate:
//! - Routing of steps to named pools and the calling pool
//! - Decoupled (asynchronous) threads landing on the default pool
//! - Caller-runs fallback when a pool rejects a job
//! - One active step per logical thread on a multi-worker pool
//! - Pool statistics and shutdown

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus_flow::config::{PoolConfig, PoolKind, SchedulerConfig};
use prometheus_flow::core::{
    FlowOutcome, Invocation, PoolId, PoolRegistry, ProcessDefinition, Scheduler, TaskDefinition,
    TaskOutcome, ThreadedPool, WorkerPool,
};
use serde_json::{json, Value};

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn threaded(name: &str, workers: usize, depth: usize) -> Arc<dyn WorkerPool> {
    let cfg = PoolConfig::new(PoolKind::Threaded)
        .with_worker_count(workers)
        .with_max_queue_depth(depth);
    Arc::new(ThreadedPool::new(name, &cfg).expect("threaded pool"))
}

fn worker_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

/// Task recording the OS thread it ran on.
fn where_ran(name: &str, seen: &Arc<Mutex<Vec<String>>>) -> prometheus_flow::core::TaskDefinitionBuilder {
    let seen = Arc::clone(seen);
    TaskDefinition::builder(name).body_fn(move |ctx| {
        seen.lock().push(worker_name());
        TaskOutcome::Success(ctx.parameter().clone())
    })
}

fn process() -> ProcessDefinition {
    ProcessDefinition::builder("pools").build()
}

// ============================================================================
// ROUTING
// ============================================================================

#[test]
fn test_steps_follow_pool_responsibility() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = PoolRegistry::new(threaded("default", 2, 16)).with_pool(threaded("io", 1, 16));
    let scheduler = Scheduler::builder().pools(registry).build();

    let last = where_ran("last", &seen).pool("default").build();
    let middle = where_ran("middle", &seen).next(last).build();
    let first = where_ran("first", &seen).pool("io").next(middle).build();

    let handle = scheduler.invoke(&process(), Invocation::new(first).parameter("x"));
    assert_eq!(handle.wait(WAIT).unwrap(), FlowOutcome::Completed(json!("x")));

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].starts_with("flow-io-"), "first ran on {}", seen[0]);
    // No pool preference: stays on the pool that activated it.
    assert!(seen[1].starts_with("flow-io-"), "middle ran on {}", seen[1]);
    assert!(seen[2].starts_with("flow-default-"), "last ran on {}", seen[2]);
    scheduler.shutdown();
}

#[test]
fn test_unknown_pool_falls_back_to_default() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::builder().pool(threaded("default", 1, 16)).build();

    let task = where_ran("lost", &seen).pool("gpu").build();
    let handle = scheduler.invoke(&process(), Invocation::new(task));

    assert!(handle.wait(WAIT).unwrap().is_completed());
    assert!(seen.lock()[0].starts_with("flow-default-"));
    scheduler.shutdown();
}

#[test]
fn test_asynchronous_threads_are_decoupled() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let registry = PoolRegistry::new(threaded("default", 2, 16)).with_pool(threaded("io", 1, 16));
    let scheduler = Scheduler::builder().pools(registry).build();

    let detached = where_ran("detached", &seen).build();
    let spawner = TaskDefinition::builder("spawner")
        .pool("io")
        .body_fn(move |ctx| {
            let future = ctx.asynchronous(Arc::clone(&detached), Value::Null);
            ctx.join(&future, 5_000, Value::Null);
            TaskOutcome::done()
        })
        .build();

    let handle = scheduler.invoke(&process(), Invocation::new(spawner));
    assert!(handle.wait(WAIT).unwrap().is_completed());
    assert!(seen.lock()[0].starts_with("flow-default-"));
    scheduler.shutdown();
}

// ============================================================================
// REJECTION
// ============================================================================

#[test]
fn test_caller_runs_after_shutdown() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::builder().pool(threaded("default", 2, 16)).build();
    scheduler.shutdown();

    let task = where_ran("inline", &seen).build();
    let handle = scheduler.invoke(&process(), Invocation::new(task).parameter(1));

    // Ran on this thread before invoke returned.
    assert!(handle.is_complete());
    assert_eq!(handle.outcome(), Some(FlowOutcome::Completed(json!(1))));
    assert_eq!(seen.lock().clone(), vec![worker_name()]);

    let stats = &scheduler.pool_stats()[&PoolId::new("default")];
    assert_eq!(stats.rejected_jobs, 1);
    assert_eq!(stats.submitted_jobs, 0);
}

#[test]
fn test_caller_runs_when_queue_is_full() {
    let scheduler = Scheduler::builder().pool(threaded("default", 1, 1)).build();

    let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let blocker = TaskDefinition::builder("blocker")
        .body_fn(move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            TaskOutcome::success("unblocked")
        })
        .build();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let quick = where_ran("quick", &seen).build();

    // Occupy the only worker, then the only queue slot.
    let blocked = scheduler.invoke(&process(), Invocation::new(blocker));
    started_rx.recv_timeout(WAIT).expect("blocker started");
    let queued = scheduler.invoke(&process(), Invocation::new(Arc::clone(&quick)).parameter("queued"));
    let overflow = scheduler.invoke(&process(), Invocation::new(quick).parameter("overflow"));

    assert_eq!(overflow.outcome(), Some(FlowOutcome::Completed(json!("overflow"))));
    assert!(!queued.is_complete());
    assert_eq!(seen.lock().clone(), vec![worker_name()]);

    release_tx.send(()).expect("release blocker");
    assert_eq!(blocked.wait(WAIT).unwrap(), FlowOutcome::Completed(json!("unblocked")));
    assert_eq!(queued.wait(WAIT).unwrap(), FlowOutcome::Completed(json!("queued")));

    let stats = &scheduler.pool_stats()[&PoolId::new("default")];
    assert_eq!(stats.rejected_jobs, 1);
    assert_eq!(stats.submitted_jobs, 2);
    scheduler.shutdown();
}

// ============================================================================
// CONCURRENCY AND STATISTICS
// ============================================================================

#[test]
fn test_one_active_step_per_logical_thread() {
    let scheduler = Scheduler::builder().pool(threaded("default", 4, 256)).build();
    let runs = Arc::new(AtomicUsize::new(0));

    let leaf = {
        let runs = Arc::clone(&runs);
        TaskDefinition::builder("leaf")
            .body_fn(move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
                TaskOutcome::done()
            })
            .build()
    };
    let fan = TaskDefinition::builder("fan")
        .body_fn(move |ctx| {
            for i in 0..32 {
                ctx.parallel(Arc::clone(&leaf), i);
            }
            TaskOutcome::done()
        })
        .build();
    let root = TaskDefinition::builder("root")
        .body_fn(move |ctx| {
            let futures: Vec<_> = (0..8)
                .map(|i| ctx.asynchronous(Arc::clone(&fan), i))
                .collect();
            for future in &futures {
                ctx.join(future, 5_000, Value::Null);
            }
            TaskOutcome::success("joined")
        })
        .build();

    let handle = scheduler.invoke(&process(), Invocation::new(root));

    assert_eq!(handle.wait(WAIT).unwrap(), FlowOutcome::Completed(json!("joined")));
    assert_eq!(runs.load(Ordering::SeqCst), 8 * 32);
    let stats = scheduler.stats();
    assert_eq!(stats.threads_started, 9);
    assert_eq!(stats.threads_completed, 9);
    assert_eq!(stats.peak_active_steps, 1);
    scheduler.shutdown();
}

#[test]
fn test_pool_stats_after_shutdown() {
    let cfg = SchedulerConfig::single(PoolConfig::new(PoolKind::Threaded).with_worker_count(2));
    let scheduler = Scheduler::from_config(&cfg).expect("scheduler");

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let task = TaskDefinition::builder("echo").build();
            scheduler.invoke(&process(), Invocation::new(task).parameter(i))
        })
        .collect();
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.wait(WAIT).unwrap(), FlowOutcome::Completed(json!(i)));
    }

    scheduler.shutdown();
    let stats = &scheduler.pool_stats()[&PoolId::new("default")];
    assert_eq!(stats.worker_count, 2);
    assert_eq!(stats.submitted_jobs, 10);
    assert_eq!(stats.completed_jobs, 10);
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.queued_jobs, 0);
    assert_eq!(scheduler.stats().processes_completed, 10);
}
