//! Benchmarks for the flow scheduler.
//!
//! Benchmarks cover:
//! - Sequential chains on a passive pool (state machine overhead)
//! - Parallel fan-out within one logical thread
//! - Asynchronous fan-out and join across a threaded pool
//! - Escalation to a local handler
//! - Awaiting a process from a tokio runtime

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use prometheus_flow::config::{PoolConfig, PoolKind, DEFAULT_POOL_NAME};
use prometheus_flow::core::{
    EscalationProcedure, FailureKind, Invocation, ProcessDefinition, Scheduler, TaskDefinition,
    TaskKind, TaskOutcome, ThreadedPool,
};
use serde_json::Value;
use tokio::runtime::Runtime;

const WAIT: Duration = Duration::from_secs(30);

// ============================================================================
// Helper Functions
// ============================================================================

fn increment() -> Arc<TaskDefinition> {
    TaskDefinition::builder("increment")
        .body_fn(|ctx| TaskOutcome::success(ctx.parameter().as_u64().unwrap_or(0) + 1))
        .build()
}

/// A static chain of `length` incrementing tasks.
fn chain(length: u64) -> Arc<TaskDefinition> {
    let mut entry = increment();
    for _ in 1..length {
        entry = TaskDefinition::builder("increment")
            .body_fn(|ctx| TaskOutcome::success(ctx.parameter().as_u64().unwrap_or(0) + 1))
            .next(entry)
            .build();
    }
    entry
}

fn fan_out(width: u64) -> Arc<TaskDefinition> {
    let leaf = increment();
    TaskDefinition::builder("fan")
        .body_fn(move |ctx| {
            for i in 0..width {
                ctx.parallel(Arc::clone(&leaf), i);
            }
            TaskOutcome::done()
        })
        .build()
}

fn threaded_scheduler(workers: usize) -> Scheduler {
    let cfg = PoolConfig::new(PoolKind::Threaded).with_worker_count(workers);
    let pool = ThreadedPool::new(DEFAULT_POOL_NAME, &cfg).expect("threaded pool");
    Scheduler::builder().pool(Arc::new(pool)).build()
}

// ============================================================================
// Passive Pool Benchmarks
// ============================================================================

fn bench_sequential_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_chain");
    let scheduler = Scheduler::builder().build();
    let process = ProcessDefinition::builder("bench").build();

    for length in [1_u64, 10, 100] {
        let entry = chain(length);
        group.throughput(Throughput::Elements(length));
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, _| {
            b.iter(|| {
                let handle = scheduler.invoke(&process, Invocation::new(Arc::clone(&entry)));
                black_box(handle.wait(WAIT).expect("chain finished"))
            });
        });
    }
    group.finish();
}

fn bench_parallel_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_fan_out");
    let scheduler = Scheduler::builder().build();
    let process = ProcessDefinition::builder("bench").build();

    for width in [10_u64, 100, 1000] {
        let entry = fan_out(width);
        group.throughput(Throughput::Elements(width));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                let handle = scheduler.invoke(&process, Invocation::new(Arc::clone(&entry)));
                black_box(handle.wait(WAIT).expect("fan-out finished"))
            });
        });
    }
    group.finish();
}

fn bench_local_escalation(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_escalation");
    let scheduler = Scheduler::builder().build();
    let process = ProcessDefinition::builder("bench").build();

    let recover = TaskDefinition::builder("recover")
        .kind(TaskKind::EscalationHandler)
        .build();
    let procedure = EscalationProcedure::new("local")
        .on(FailureKind::any(), recover)
        .build();
    let failing = TaskDefinition::builder("failing")
        .escalation(procedure)
        .body_fn(|_| TaskOutcome::fail("bench.failure", "expected"))
        .build();

    group.bench_function("fail_and_handle", |b| {
        b.iter(|| {
            let handle = scheduler.invoke(&process, Invocation::new(Arc::clone(&failing)));
            black_box(handle.wait(WAIT).expect("handled"))
        });
    });
    group.finish();
}

// ============================================================================
// Threaded Pool Benchmarks
// ============================================================================

fn bench_async_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_join");
    let scheduler = threaded_scheduler(4);
    let process = ProcessDefinition::builder("bench").build();

    for threads in [4_u64, 16, 64] {
        let worker = chain(10);
        let root = TaskDefinition::builder("root")
            .body_fn(move |ctx| {
                for i in 0..threads {
                    let future = ctx.asynchronous(Arc::clone(&worker), i);
                    ctx.join(&future, 30_000, Value::Null);
                }
                TaskOutcome::done()
            })
            .build();
        group.throughput(Throughput::Elements(threads));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                let handle = scheduler.invoke(&process, Invocation::new(Arc::clone(&root)));
                black_box(handle.wait(WAIT).expect("joined"))
            });
        });
    }
    group.finish();
    scheduler.shutdown();
}

fn bench_wait_async(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait_async");
    let scheduler = threaded_scheduler(2);
    let process = ProcessDefinition::builder("bench").build();
    let entry = chain(10);

    group.bench_function("chain_10", |b| {
        b.to_async(Runtime::new().unwrap()).iter(|| async {
            let handle = scheduler.invoke(&process, Invocation::new(Arc::clone(&entry)));
            black_box(handle.wait_async(WAIT).await.expect("chain finished"))
        });
    });
    group.finish();
    scheduler.shutdown();
}

criterion_group!(
    benches,
    bench_sequential_chain,
    bench_parallel_fan_out,
    bench_local_escalation,
    bench_async_join,
    bench_wait_async,
);
criterion_main!(benches);
