//! Convergence outcomes and the mutation log.
//!
//! Every converger threads a [`MutationLog`] through one pass and records each
//! mutating call right before issuing it. The log turns into exactly one
//! [`ConvergenceOutcome`] at the end of the pass, even when the pass stops on
//! an error ([`ConvergeFailure`] keeps what was done up to that point), and a
//! [`ConvergenceReport`] collects outcomes across declarations.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::converge_error::ConvergeError;
use crate::resources::ResourceKind;

/// Result of one convergence invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// Nothing needed to change.
    Unchanged,
    /// The object did not exist and was created.
    Created,
    /// The object existed and was modified.
    Updated,
    /// The object existed and was deleted.
    Destroyed,
    /// The pass aborted.
    Failed,
}

impl OutcomeKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable result of one convergence invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvergenceOutcome {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Logical name from the declaration.
    pub name: String,
    /// Remote identifier, when one exists or existed.
    pub id: Option<String>,
    /// What happened.
    pub outcome: OutcomeKind,
    /// Whether any mutating call was issued.
    pub mutated: bool,
    /// Mutating calls, in issue order.
    pub actions: Vec<String>,
    /// Error message for failed outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConvergenceOutcome {
    /// Whether this outcome left the remote object untouched.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.outcome == OutcomeKind::Unchanged && !self.mutated
    }
}

impl fmt::Display for ConvergenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.kind, self.name, self.outcome)?;
        if let Some(id) = &self.id {
            write!(f, " ({id})")?;
        }
        if let Some(err) = &self.error {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

/// Ordered record of the mutating calls issued during one pass.
#[derive(Debug, Clone)]
pub struct MutationLog {
    kind: ResourceKind,
    name: String,
    id: Option<String>,
    actions: Vec<String>,
}

impl MutationLog {
    /// Start a log for one resource.
    #[must_use]
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            id: None,
            actions: Vec::new(),
        }
    }

    /// Remember the remote id of the object once it is found or created.
    pub fn identify(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    /// Record a mutating call about to be issued.
    pub fn record(&mut self, action: impl Into<String>) {
        let action = action.into();
        info!(kind = %self.kind, name = %self.name, "{action}");
        self.actions.push(action);
    }

    /// Whether anything was recorded.
    #[must_use]
    pub fn mutated(&self) -> bool {
        !self.actions.is_empty()
    }

    /// Recorded calls so far.
    #[must_use]
    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    /// Resource kind of this log.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Logical name of this log.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the log into an outcome.
    #[must_use]
    pub fn finish(self, outcome: OutcomeKind) -> ConvergenceOutcome {
        ConvergenceOutcome {
            kind: self.kind,
            name: self.name,
            id: self.id,
            outcome,
            mutated: !self.actions.is_empty(),
            actions: self.actions,
            error: None,
        }
    }

    /// Close the log into a failure that keeps the id and actions recorded so far.
    #[must_use]
    pub fn fail(self, error: ConvergeError) -> ConvergeFailure {
        let message = error.to_string();
        let mut outcome = self.finish(OutcomeKind::Failed);
        outcome.error = Some(message);
        ConvergeFailure {
            error,
            outcome: Box::new(outcome),
        }
    }

    /// Close the log with the result of a pass.
    ///
    /// # Errors
    ///
    /// Returns the pass error wrapped with the failed outcome.
    pub fn settle(self, result: Result<OutcomeKind, ConvergeError>) -> Result<ConvergenceOutcome, ConvergeFailure> {
        match result {
            Ok(outcome) => Ok(self.finish(outcome)),
            Err(error) => Err(self.fail(error)),
        }
    }
}

/// A pass that stopped on an error.
///
/// Displays as the error. `outcome` is the `failed` outcome with the remote id
/// and the mutating calls issued before the error.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ConvergeFailure {
    /// Why the pass stopped.
    #[source]
    pub error: ConvergeError,
    /// What the pass did before stopping.
    pub outcome: Box<ConvergenceOutcome>,
}

/// Outcomes across several declarations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvergenceReport {
    outcomes: Vec<ConvergenceOutcome>,
}

impl ConvergenceReport {
    /// Create an empty report.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            outcomes: Vec::new(),
        }
    }

    /// Append an outcome.
    pub fn push(&mut self, outcome: ConvergenceOutcome) {
        self.outcomes.push(outcome);
    }

    /// All outcomes in order.
    #[must_use]
    pub fn outcomes(&self) -> &[ConvergenceOutcome] {
        &self.outcomes
    }

    /// Whether any declaration issued a mutating call.
    #[must_use]
    pub fn mutated(&self) -> bool {
        self.outcomes.iter().any(|o| o.mutated)
    }

    /// Whether every declaration came back unchanged.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.outcomes.iter().all(ConvergenceOutcome::is_unchanged)
    }

    /// Failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &ConvergenceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == OutcomeKind::Failed)
    }

    /// Number of outcomes of the given kind.
    #[must_use]
    pub fn count(&self, outcome: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|o| o.outcome == outcome).count()
    }
}
