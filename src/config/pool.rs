//! Pool and scheduler configuration structures.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

/// Default worker thread stack size (2 MiB).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Name of the pool created when nothing else is configured.
pub const DEFAULT_POOL_NAME: &str = "default";

/// Worker pool implementation selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Dedicated OS threads.
    Threaded,
    /// Jobs run on the thread that assigns them.
    Passive,
    /// Jobs handed to a tokio runtime (feature `tokio-runtime`).
    Tokio,
}

impl PoolKind {
    fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "threaded" => Ok(Self::Threaded),
            "passive" => Ok(Self::Passive),
            "tokio" => Ok(Self::Tokio),
            other => Err(format!("unknown pool kind `{other}`")),
        }
    }
}

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool implementation.
    pub kind: PoolKind,
    /// Worker threads (ignored by passive pools).
    pub worker_count: usize,
    /// Queued jobs before assignment is rejected.
    pub max_queue_depth: usize,
    /// Worker thread stack size in bytes.
    pub thread_stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::Threaded,
            worker_count: num_cpus::get(),
            max_queue_depth: 1024,
            thread_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl PoolConfig {
    /// Configuration for a pool of the given kind with default sizes.
    #[must_use]
    pub fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the maximum queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Validate pool configuration values.
    ///
    /// # Errors
    ///
    /// A message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind == PoolKind::Passive {
            return Ok(());
        }
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.kind == PoolKind::Threaded && self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Pool used from outside any pool and for decoupled work.
    pub default_pool: String,
    /// Map of pool name to configuration.
    pub pools: HashMap<String, PoolConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::single(PoolConfig::default())
    }
}

impl SchedulerConfig {
    /// A configuration with one pool named [`DEFAULT_POOL_NAME`].
    #[must_use]
    pub fn single(pool: PoolConfig) -> Self {
        let mut pools = HashMap::new();
        pools.insert(DEFAULT_POOL_NAME.to_string(), pool);
        Self {
            default_pool: DEFAULT_POOL_NAME.to_string(),
            pools,
        }
    }

    /// Add (or replace) a named pool.
    #[must_use]
    pub fn with_pool(mut self, name: impl Into<String>, pool: PoolConfig) -> Self {
        self.pools.insert(name.into(), pool);
        self
    }

    /// Validate all pools and ensure the default pool exists.
    ///
    /// # Errors
    ///
    /// A message naming the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be defined".into());
        }
        if !self.pools.contains_key(&self.default_pool) {
            return Err(format!("default pool `{}` is not defined", self.default_pool));
        }
        for (name, pool) in &self.pools {
            pool.validate()
                .map_err(|e| format!("pool `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// A parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Single-pool configuration from the environment.
    ///
    /// Loads `.env` if present, then reads `FLOW_POOL_KIND`,
    /// `FLOW_WORKER_COUNT` and `FLOW_MAX_QUEUE_DEPTH`. Unset variables keep
    /// their defaults.
    ///
    /// # Errors
    ///
    /// A message for an unparsable variable or an invalid result.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut pool = PoolConfig::default();
        if let Some(kind) = lookup("FLOW_POOL_KIND") {
            pool.kind = PoolKind::parse(&kind)?;
        }
        if let Some(count) = lookup("FLOW_WORKER_COUNT") {
            pool.worker_count = count
                .trim()
                .parse()
                .map_err(|e| format!("FLOW_WORKER_COUNT: {e}"))?;
        }
        if let Some(depth) = lookup("FLOW_MAX_QUEUE_DEPTH") {
            pool.max_queue_depth = depth
                .trim()
                .parse()
                .map_err(|e| format!("FLOW_MAX_QUEUE_DEPTH: {e}"))?;
        }
        let cfg = Self::single(pool);
        cfg.validate()?;
        Ok(cfg)
    }
}
