//! Scheduler-wide statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of scheduler activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStats {
    /// Processes invoked.
    pub processes_started: u64,
    /// Processes finished (either way).
    pub processes_completed: u64,
    /// Processes that ended in the failed state.
    pub processes_failed: u64,
    /// Logical threads created.
    pub threads_started: u64,
    /// Logical threads finished.
    pub threads_completed: u64,
    /// Task nodes created.
    pub nodes_created: u64,
    /// Task nodes that completed.
    pub nodes_completed: u64,
    /// Task nodes removed by escalation or thread failure.
    pub nodes_cleared: u64,
    /// Application failures raised.
    pub failures: u64,
    /// Failures routed to a handler.
    pub escalations_handled: u64,
    /// Unhandled or framework-fatal failures.
    pub fatal_failures: u64,
    /// Highest number of simultaneously running steps seen on one logical thread.
    pub peak_active_steps: usize,
}

/// Internal counters for scheduler statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct FlowCounters {
    processes_started: AtomicU64,
    processes_completed: AtomicU64,
    processes_failed: AtomicU64,
    threads_started: AtomicU64,
    threads_completed: AtomicU64,
    nodes_created: AtomicU64,
    nodes_completed: AtomicU64,
    nodes_cleared: AtomicU64,
    failures: AtomicU64,
    escalations_handled: AtomicU64,
    fatal_failures: AtomicU64,
    peak_active_steps: AtomicUsize,
}

impl FlowCounters {
    pub fn process_started(&self) {
        self.processes_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn process_completed(&self, failed: bool) {
        self.processes_completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.processes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn thread_started(&self) {
        self.threads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thread_completed(&self) {
        self.threads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_created(&self) {
        self.nodes_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn node_completed(&self) {
        self.nodes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn nodes_cleared(&self, count: usize) {
        self.nodes_cleared.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn escalation_handled(&self) {
        self.escalations_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fatal_failure(&self) {
        self.fatal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_active_steps(&self, active: usize) {
        self.peak_active_steps.fetch_max(active, Ordering::Relaxed);
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> FlowStats {
        FlowStats {
            processes_started: self.processes_started.load(Ordering::Relaxed),
            processes_completed: self.processes_completed.load(Ordering::Relaxed),
            processes_failed: self.processes_failed.load(Ordering::Relaxed),
            threads_started: self.threads_started.load(Ordering::Relaxed),
            threads_completed: self.threads_completed.load(Ordering::Relaxed),
            nodes_created: self.nodes_created.load(Ordering::Relaxed),
            nodes_completed: self.nodes_completed.load(Ordering::Relaxed),
            nodes_cleared: self.nodes_cleared.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            escalations_handled: self.escalations_handled.load(Ordering::Relaxed),
            fatal_failures: self.fatal_failures.load(Ordering::Relaxed),
            peak_active_steps: self.peak_active_steps.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_peak() {
        let counters = FlowCounters::default();
        counters.process_started();
        counters.process_completed(true);
        counters.nodes_cleared(3);
        counters.observe_active_steps(1);
        counters.observe_active_steps(2);
        counters.observe_active_steps(1);

        let stats = counters.snapshot();
        assert_eq!(stats.processes_started, 1);
        assert_eq!(stats.processes_failed, 1);
        assert_eq!(stats.nodes_cleared, 3);
        assert_eq!(stats.peak_active_steps, 2);
    }
}
