//! # Prometheus Flow
//!
//! A concurrent task-flow execution core for the Prometheus AI Platform.
//!
//! Applications describe work as a graph of [`TaskDefinition`](core::TaskDefinition)s.
//! At run time every task becomes a task node that moves through a fixed
//! state machine:
//!
//! ```text
//! LOAD_RESOURCES -> GOVERN_RESOURCES -> COORDINATE_RESOURCES -> EXECUTE
//!     -> HANDLE_COMPLETION -> ACTIVATE_NEXT -> COMPLETED        (or FAILED)
//! ```
//!
//! ## Key Features
//!
//! - **Logical threads**: nodes of one logical thread run strictly one step at a
//!   time, whichever worker happens to pick them up.
//! - **Continuations**: sequential (same path), parallel (child path, the owner
//!   waits) and asynchronous (a new, decoupled logical thread), plus `join`.
//! - **Non-blocking resources**: resource loading, supervision toggles and
//!   coordination report "not ready" and re-activate the node later instead of
//!   parking a worker.
//! - **Escalation**: failures are routed to handler tasks found on the failing
//!   node's owner chain, then process-wide, per-invocation and top-level
//!   fallbacks.
//! - **Worker pools**: dedicated OS threads, a passive in-caller pool, or a
//!   tokio runtime (feature `tokio-runtime`).
//!
//! ```rust,ignore
//! use prometheus_flow::core::{
//!     Invocation, ProcessDefinition, Scheduler, TaskDefinition, TaskOutcome,
//! };
//! use std::time::Duration;
//!
//! let double = TaskDefinition::builder("double")
//!     .body_fn(|ctx| TaskOutcome::success(ctx.parameter().as_i64().unwrap_or(0) * 2))
//!     .build();
//! let scheduler = Scheduler::builder().build();
//! let process = ProcessDefinition::builder("demo").build();
//! let handle = scheduler.invoke(&process, Invocation::new(double).parameter(21));
//! let outcome = handle.wait(Duration::from_secs(5))?;
//! ```
//!
//! For complete examples, see `tests/flow_test.rs`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling abstractions.
pub mod core;
/// Configuration models for worker pools and the scheduler.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
