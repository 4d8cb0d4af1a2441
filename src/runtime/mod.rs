//! Runtime adapters.

#[cfg(feature = "tokio-runtime")]
pub mod tokio_pool;

#[cfg(feature = "tokio-runtime")]
pub use tokio_pool::TokioPool;
