//! Supervision grants: cross-cutting enable/disable wrappers (transactions,
//! audit scopes, leases) around resource access.
//!
//! A process definition lists its [`Supervisor`]s; task definitions refer to
//! them by index and say whether they need each one active or inactive. The
//! grant table is per logical thread.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::definition::DeactivationPolicy;
use super::error::Failure;
use super::resources::{Poll, Readiness, ResourceValue};
use super::thread::Wakeup;

/// Result of a supervision toggle.
#[derive(Debug)]
pub enum Toggle {
    /// Switched synchronously.
    Done,
    /// Switch in flight; the grant changes state when the signal completes.
    Pending(Readiness),
}

/// One supervision kind.
///
/// Each call receives the resources of the node that needed the toggle
/// (empty when a thread finishes and remaining grants are released). Like
/// resource sources, supervisors run under the process resource-coordination
/// lock and must not complete their own [`Readiness`] from inside the call.
pub trait Supervisor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Switch the supervision on.
    ///
    /// # Errors
    ///
    /// Fails the node that requested the toggle.
    fn activate(&self, resources: &[ResourceValue]) -> Result<Toggle, Failure>;

    /// Switch off, keeping the supervised work.
    ///
    /// # Errors
    ///
    /// Fails the node that requested the toggle.
    fn enforce(&self, resources: &[ResourceValue]) -> Result<Toggle, Failure>;

    /// Switch off, discarding the supervised work.
    ///
    /// # Errors
    ///
    /// Fails the node that requested the toggle.
    fn disregard(&self, resources: &[ResourceValue]) -> Result<Toggle, Failure>;
}

#[derive(Default)]
struct Grant {
    active: bool,
    in_flight: Option<(bool, Readiness)>,
}

/// Active/inactive flag per supervision kind for one logical thread.
pub(crate) struct SupervisionGrants {
    supervisors: Arc<[Arc<dyn Supervisor>]>,
    grants: Vec<Grant>,
}

impl SupervisionGrants {
    pub fn new(supervisors: &Arc<[Arc<dyn Supervisor>]>) -> Self {
        Self {
            grants: supervisors.iter().map(|_| Grant::default()).collect(),
            supervisors: Arc::clone(supervisors),
        }
    }

    /// Whether the grant at `index` is currently active.
    #[cfg(test)]
    pub fn is_active(&self, index: usize) -> bool {
        self.grants.get(index).is_some_and(|g| g.active)
    }

    /// Bring the grant at `index` to `desired`. Returns `false` while a toggle
    /// is in flight; `waiter` is re-activated when it lands.
    pub fn toggle(
        &mut self,
        index: usize,
        desired: bool,
        policy: DeactivationPolicy,
        resources: &[ResourceValue],
        waiter: &Wakeup,
    ) -> Result<bool, Failure> {
        let (Some(supervisor), Some(grant)) = (self.supervisors.get(index), self.grants.get_mut(index))
        else {
            return Err(Failure::new(
                "supervision.unknown",
                format!("no supervisor at index {index}"),
            ));
        };

        if let Some((target, readiness)) = &grant.in_flight {
            match readiness.poll(waiter) {
                Poll::Ready => {
                    grant.active = *target;
                    grant.in_flight = None;
                }
                Poll::Pending => return Ok(false),
                Poll::Failed(failure) => {
                    grant.in_flight = None;
                    return Err(failure);
                }
            }
        }
        if grant.active == desired {
            return Ok(true);
        }

        debug!(supervisor = supervisor.name(), desired, ?policy, "toggling supervision");
        let toggle = match (desired, policy) {
            (true, _) => supervisor.activate(resources)?,
            (false, DeactivationPolicy::Enforce) => supervisor.enforce(resources)?,
            (false, DeactivationPolicy::Disregard) => supervisor.disregard(resources)?,
        };
        let readiness = match toggle {
            Toggle::Done => {
                grant.active = desired;
                return Ok(true);
            }
            Toggle::Pending(readiness) => readiness,
        };
        match readiness.poll(waiter) {
            Poll::Ready => {
                grant.active = desired;
                Ok(true)
            }
            Poll::Pending => {
                grant.in_flight = Some((desired, readiness));
                Ok(false)
            }
            Poll::Failed(failure) => Err(failure),
        }
    }

    /// Switch off every grant still active. Asynchronous deactivations are
    /// started but not awaited.
    pub fn deactivate_all(&mut self, policy: DeactivationPolicy) -> Vec<Failure> {
        let mut failures = Vec::new();
        for (supervisor, grant) in self.supervisors.iter().zip(self.grants.iter_mut()) {
            let active = grant
                .in_flight
                .take()
                .map_or(grant.active, |(target, _)| target);
            if !active {
                continue;
            }
            grant.active = false;
            let result = match policy {
                DeactivationPolicy::Enforce => supervisor.enforce(&[]),
                DeactivationPolicy::Disregard => supervisor.disregard(&[]),
            };
            match result {
                Ok(Toggle::Done) => {}
                Ok(Toggle::Pending(_)) => {
                    debug!(supervisor = supervisor.name(), "final deactivation left in flight");
                }
                Err(failure) => {
                    warn!(supervisor = supervisor.name(), %failure, "supervision release failed");
                    failures.push(failure);
                }
            }
        }
        failures
    }
}

impl fmt::Debug for SupervisionGrants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let active: Vec<bool> = self.grants.iter().map(|g| g.active).collect();
        f.debug_struct("SupervisionGrants").field("active", &active).finish()
    }
}
