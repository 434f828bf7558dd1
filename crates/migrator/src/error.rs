//! Migration error types.

use doc_store::StoreError;
use thiserror::Error;

/// Boxed error raised by a change step body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while running migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A required setting is missing or invalid. Raised before connecting.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation needed a store handle that was never attached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The process lock could not be obtained under the configured policy.
    #[error("Lock acquire error: {0}")]
    LockAcquire(String),

    /// Two declared change steps share an id.
    #[error("Duplicate change id found: {0}")]
    DuplicateChangeId(String),

    /// Two declared migration units share a name.
    #[error("Duplicate migration unit name found: {0}")]
    DuplicateUnitName(String),

    /// A change step failed for a reason other than a contract violation.
    #[error("Change step {change_id} failed: {source}")]
    Invocation {
        change_id: String,
        #[source]
        source: BoxError,
    },

    /// A rollback command failed.
    #[error("Rollback of change {change_id} failed on command {command}: {source}")]
    Rollback {
        change_id: String,
        command: String,
        #[source]
        source: StoreError,
    },

    /// A document store error occurred.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A history or lock document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by a change step body.
///
/// `Contract` is recovered locally: the engine logs it, reports the step and
/// moves on. `Failed` aborts the whole run.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step cannot be invoked as declared.
    #[error("Change step contract violated: {0}")]
    Contract(String),

    /// The step body failed.
    #[error("{0}")]
    Failed(BoxError),
}

impl StepError {
    /// Creates a contract violation.
    pub fn contract(reason: impl Into<String>) -> Self {
        Self::Contract(reason.into())
    }

    /// Wraps any error as a fatal step failure.
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }
}

impl From<StoreError> for StepError {
    fn from(error: StoreError) -> Self {
        Self::Failed(Box::new(error))
    }
}

/// Convenience type alias for migration results.
pub type Result<T> = std::result::Result<T, MigrationError>;
