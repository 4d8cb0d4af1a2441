//! Configuration models for worker pools and the scheduler.

pub mod pool;

pub use pool::{PoolConfig, PoolKind, SchedulerConfig, DEFAULT_POOL_NAME, DEFAULT_STACK_SIZE};
