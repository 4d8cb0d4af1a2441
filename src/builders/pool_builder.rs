//! Builders to construct worker pools from configuration.

use std::sync::Arc;

use tracing::debug;

use crate::config::{PoolConfig, PoolKind, SchedulerConfig};
use crate::core::{FlowError, PassivePool, PoolRegistry, WorkerPool};

/// Build one worker pool.
///
/// # Errors
///
/// `FlowError::InvalidConfig` for invalid values or a pool kind unavailable in
/// this build; `FlowError::Internal` if workers cannot be started.
pub fn build_pool(name: &str, cfg: &PoolConfig) -> Result<Arc<dyn WorkerPool>, FlowError> {
    cfg.validate()
        .map_err(|e| FlowError::InvalidConfig(format!("pool `{name}` invalid: {e}")))?;
    debug!(pool = name, kind = ?cfg.kind, "building worker pool");
    match cfg.kind {
        PoolKind::Passive => Ok(Arc::new(PassivePool::new(name))),
        #[cfg(not(target_arch = "wasm32"))]
        PoolKind::Threaded => Ok(Arc::new(crate::core::ThreadedPool::new(name, cfg)?)),
        #[cfg(feature = "tokio-runtime")]
        PoolKind::Tokio => Ok(Arc::new(crate::runtime::TokioPool::with_worker_threads(
            name,
            cfg.worker_count,
        )?)),
        #[allow(unreachable_patterns)]
        other => Err(FlowError::InvalidConfig(format!(
            "pool `{name}`: {other:?} pools are not available in this build"
        ))),
    }
}

/// Build every configured pool into a registry.
///
/// # Errors
///
/// The first validation or construction error.
pub fn build_pools(cfg: &SchedulerConfig) -> Result<PoolRegistry, FlowError> {
    cfg.validate().map_err(FlowError::InvalidConfig)?;

    let default_cfg = cfg
        .pools
        .get(&cfg.default_pool)
        .ok_or_else(|| FlowError::InvalidConfig(format!("default pool `{}` is not defined", cfg.default_pool)))?;
    let mut registry = PoolRegistry::new(build_pool(&cfg.default_pool, default_cfg)?);

    let mut names: Vec<&String> = cfg.pools.keys().filter(|n| **n != cfg.default_pool).collect();
    names.sort();
    for name in names {
        registry.register(build_pool(name, &cfg.pools[name])?);
    }
    Ok(registry)
}
