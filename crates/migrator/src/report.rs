//! Summary of a migration run.

use serde::{Deserialize, Serialize};

/// What happened to one change step during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Invoked for the first time and recorded in history.
    Applied,
    /// Already recorded; invoked again because it is run-always.
    Reapplied,
    /// Already recorded; not invoked.
    Skipped,
    /// The step reported a contract violation. Nothing was recorded.
    ContractViolation { reason: String },
    /// No longer declared; its rollback commands ran and its history was removed.
    RolledBack,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Applied => "applied",
            StepOutcome::Reapplied => "reapplied",
            StepOutcome::Skipped => "skipped",
            StepOutcome::ContractViolation { .. } => "contract_violation",
            StepOutcome::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one step, tagged with its identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub unit_name: String,
    pub change_id: String,
    pub author: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RunStatus {
    /// The lock was taken and every unit processed.
    #[default]
    Completed,
    /// The engine is switched off. Nothing was touched.
    Disabled,
    /// Another process held the lock and the engine was configured to return quietly.
    LockNotAcquired,
}

/// Result of [`crate::Migrator::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MigrationReport {
    pub status: RunStatus,
    /// Outcomes in execution order: rollbacks first, then forward steps.
    pub steps: Vec<StepRecord>,
}

impl MigrationReport {
    pub(crate) fn with_status(status: RunStatus) -> Self {
        Self {
            status,
            steps: Vec::new(),
        }
    }

    pub(crate) fn record(
        &mut self,
        unit_name: &str,
        change_id: &str,
        author: &str,
        outcome: StepOutcome,
    ) {
        self.steps.push(StepRecord {
            unit_name: unit_name.to_string(),
            change_id: change_id.to_string(),
            author: author.to_string(),
            outcome,
        });
    }

    fn count(&self, pred: impl Fn(&StepOutcome) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(&s.outcome)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Applied))
    }

    pub fn reapplied(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Reapplied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::Skipped))
    }

    pub fn rolled_back(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::RolledBack))
    }

    pub fn contract_violations(&self) -> usize {
        self.count(|o| matches!(o, StepOutcome::ContractViolation { .. }))
    }

    /// Returns the outcome recorded for `change_id`, if any.
    pub fn outcome_of(&self, change_id: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.change_id == change_id)
            .map(|s| &s.outcome)
    }
}
