//! Completion handles for logical threads and processes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::error::{FlowError, FlowOutcome};

type Callback = Box<dyn FnOnce(&FlowOutcome) + Send>;

#[derive(Default)]
struct FutureState {
    outcome: Option<FlowOutcome>,
    callbacks: Vec<Callback>,
}

struct Shared {
    state: Mutex<FutureState>,
    ready: Condvar,
}

/// Handle resolved once a logical thread (or a whole process) finishes.
///
/// Returned by asynchronous continuations and accepted by
/// [`TaskContext::join`](super::TaskContext::join). Cloning yields another
/// handle to the same completion.
#[derive(Clone)]
pub struct FlowFuture {
    shared: Arc<Shared>,
}

impl FlowFuture {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(FutureState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolve once. Callbacks run on the calling thread, outside the lock.
    pub(crate) fn resolve(&self, outcome: FlowOutcome) {
        let callbacks = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome.clone());
            self.shared.ready.notify_all();
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&outcome);
        }
    }

    /// Run `callback` when resolved, immediately if already resolved.
    pub(crate) fn on_complete(&self, callback: impl FnOnce(&FlowOutcome) + Send + 'static) {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Whether the outcome is available.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// The outcome, if available.
    #[must_use]
    pub fn outcome(&self) -> Option<FlowOutcome> {
        self.shared.state.lock().outcome.clone()
    }

    /// Block until resolved or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `FlowError::Timeout` if the outcome is not available in time.
    pub fn wait(&self, timeout: Duration) -> Result<FlowOutcome, FlowError> {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() {
            self.shared
                .ready
                .wait_while_for(&mut state, |s| s.outcome.is_none(), timeout);
        }
        state.outcome.clone().ok_or(FlowError::Timeout)
    }

    /// Wait asynchronously until resolved or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// `FlowError::Timeout` if the outcome is not available in time.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<FlowOutcome, FlowError> {
        if let Some(outcome) = self.outcome() {
            return Ok(outcome);
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(FlowError::Internal("completion dropped".into())),
            Err(_) => Err(FlowError::Timeout),
        }
    }

    /// Cancellation of in-flight work is not supported.
    ///
    /// # Errors
    ///
    /// Always `FlowError::Unsupported`.
    pub const fn cancel(&self) -> Result<(), FlowError> {
        Err(FlowError::Unsupported("cancel"))
    }
}

impl fmt::Debug for FlowFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowFuture")
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wait_times_out() {
        let future = FlowFuture::new();
        let err = future.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, FlowError::Timeout));
    }

    #[test]
    fn test_resolve_once_and_callbacks() {
        let future = FlowFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        future.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        future.resolve(FlowOutcome::Completed(json!(1)));
        future.resolve(FlowOutcome::Completed(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(future.outcome(), Some(FlowOutcome::Completed(json!(1))));

        let c = Arc::clone(&calls);
        future.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_across_threads() {
        let future = FlowFuture::new();
        let resolver = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.resolve(FlowOutcome::Completed(json!("done")));
        });
        let outcome = future.wait(Duration::from_secs(5)).unwrap();
        assert!(outcome.is_completed());
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_is_unsupported() {
        let future = FlowFuture::new();
        assert!(matches!(future.cancel(), Err(FlowError::Unsupported("cancel"))));
    }
}
