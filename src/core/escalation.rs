//! Escalation procedures and the fixed fallback order.
//!
//! A procedure is an ordered list of `(failure kind -> handler task)` entries;
//! the first entry whose kind catches the failure wins. Procedures are
//! consulted at several nested scopes:
//!
//! 1. the failing node and its parallel-owner chain ([`EscalationLevel::Ancestors`]),
//! 2. the process-wide procedure,
//! 3. the procedure supplied with the invocation,
//! 4. the scheduler's top-level catch-all.
//!
//! A logical thread remembers the highest fallback level it has used and
//! never tries a lower one again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::definition::TaskDefinition;
use super::error::{Failure, FailureKind};

/// One `(kind -> handler)` entry.
#[derive(Debug, Clone)]
pub struct Escalation {
    /// Failure kind caught by this entry.
    pub kind: FailureKind,
    /// Task instantiated to handle the failure.
    pub handler: Arc<TaskDefinition>,
}

/// Ordered mapping from failure kind to handler task.
#[derive(Debug, Clone)]
pub struct EscalationProcedure {
    name: String,
    entries: Vec<Escalation>,
}

impl EscalationProcedure {
    /// Create an empty procedure.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Append an entry. Earlier entries take precedence.
    #[must_use]
    pub fn on(mut self, kind: impl Into<FailureKind>, handler: Arc<TaskDefinition>) -> Self {
        self.entries.push(Escalation {
            kind: kind.into(),
            handler,
        });
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Procedure name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entries in precedence order.
    #[must_use]
    pub fn entries(&self) -> &[Escalation] {
        &self.entries
    }

    /// First handler catching `failure`.
    #[must_use]
    pub fn find(&self, failure: &Failure) -> Option<&Arc<TaskDefinition>> {
        self.entries
            .iter()
            .find(|entry| entry.kind.catches(&failure.kind))
            .map(|entry| &entry.handler)
    }
}

/// Scope at which a failure was (or is being) handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// The failing node and its parallel-owner chain.
    Ancestors,
    /// The process definition's procedure.
    ProcessWide,
    /// The procedure supplied when the process was invoked.
    Invocation,
    /// The scheduler's catch-all.
    TopLevel,
    /// Nothing matched; the failure is unrecoverable.
    Fatal,
}

/// Record of the scopes visited by one escalation search.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationTrace {
    /// Scopes visited, in order.
    pub visited: Vec<EscalationLevel>,
    /// Scope that produced the handler, if any.
    pub matched: Option<EscalationLevel>,
}

/// The three nested fallbacks tried after the ancestor chain.
#[derive(Debug, Clone, Default)]
pub(crate) struct Fallbacks {
    pub process_wide: Option<Arc<EscalationProcedure>>,
    pub invocation: Option<Arc<EscalationProcedure>>,
    pub top_level: Option<Arc<EscalationProcedure>>,
}

impl Fallbacks {
    /// Try every fallback strictly above `reached`, in fixed order.
    ///
    /// Levels without a configured procedure are still recorded as visited.
    pub fn resolve(
        &self,
        reached: EscalationLevel,
        failure: &Failure,
        trace: &mut EscalationTrace,
    ) -> Option<(EscalationLevel, Arc<EscalationProcedure>, Arc<TaskDefinition>)> {
        let levels = [
            (EscalationLevel::ProcessWide, &self.process_wide),
            (EscalationLevel::Invocation, &self.invocation),
            (EscalationLevel::TopLevel, &self.top_level),
        ];
        for (level, procedure) in levels {
            if level <= reached {
                continue;
            }
            trace.visited.push(level);
            let Some(procedure) = procedure else {
                continue;
            };
            if let Some(handler) = procedure.find(failure) {
                trace.matched = Some(level);
                return Some((level, Arc::clone(procedure), Arc::clone(handler)));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &str) -> Arc<TaskDefinition> {
        TaskDefinition::builder(name).build()
    }

    #[test]
    fn test_first_matching_entry_wins() {
        let procedure = EscalationProcedure::new("p")
            .on("io.timeout", handler("timeout"))
            .on("io", handler("io"))
            .on(FailureKind::any(), handler("any"));

        let found = |kind: &str| {
            procedure
                .find(&Failure::new(kind, "x"))
                .map(|h| h.name().to_string())
        };
        assert_eq!(found("io.timeout").as_deref(), Some("timeout"));
        assert_eq!(found("io.closed").as_deref(), Some("io"));
        assert_eq!(found("db").as_deref(), Some("any"));
    }

    #[test]
    fn test_no_match() {
        let procedure = EscalationProcedure::new("p").on("io", handler("io"));
        assert!(procedure.find(&Failure::new("db", "x")).is_none());
    }

    #[test]
    fn test_fallbacks_visit_in_order() {
        let fallbacks = Fallbacks {
            process_wide: Some(EscalationProcedure::new("process").on("a", handler("pa")).build()),
            invocation: None,
            top_level: Some(EscalationProcedure::new("top").on("b", handler("tb")).build()),
        };
        let mut trace = EscalationTrace::default();
        let (level, _, h) = fallbacks
            .resolve(EscalationLevel::Ancestors, &Failure::new("b", "x"), &mut trace)
            .expect("top level matches");
        assert_eq!(level, EscalationLevel::TopLevel);
        assert_eq!(h.name(), "tb");
        assert_eq!(
            trace.visited,
            vec![
                EscalationLevel::ProcessWide,
                EscalationLevel::Invocation,
                EscalationLevel::TopLevel
            ]
        );
        assert_eq!(trace.matched, Some(EscalationLevel::TopLevel));
    }

    #[test]
    fn test_fallbacks_never_retry_lower_levels() {
        let fallbacks = Fallbacks {
            process_wide: Some(EscalationProcedure::new("process").on("a", handler("pa")).build()),
            invocation: None,
            top_level: None,
        };
        let mut trace = EscalationTrace::default();
        let resolved =
            fallbacks.resolve(EscalationLevel::ProcessWide, &Failure::new("a", "x"), &mut trace);
        assert!(resolved.is_none());
        assert_eq!(
            trace.visited,
            vec![EscalationLevel::Invocation, EscalationLevel::TopLevel]
        );
    }
}
