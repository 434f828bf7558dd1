//! Run-once migration engine for document stores.
//!
//! Change steps are grouped into migration units and registered explicitly
//! through a [`MigrationSource`]. [`Migrator::execute`] applies every step
//! not yet recorded in the history collection, re-invokes run-always steps,
//! and rolls back steps whose declaration was removed. A lock document keeps
//! concurrently starting processes from migrating at the same time.
//!
//! ```ignore
//! use migrator::{ChangeStep, MigrationUnit, Migrator, MigratorConfig, StaticSource};
//!
//! let users = MigrationUnit::new("users", "001").step(
//!     ChangeStep::new("001", "alice", "001", |store| async move {
//!         store.insert_one("users", admin_document()).await?;
//!         Ok(())
//!     })
//!     .rollback_command(r#"{"drop": "users"}"#),
//! );
//!
//! let report = Migrator::new(MigratorConfig::from_env())
//!     .with_source(StaticSource::new().unit(users))
//!     .with_store(store)
//!     .execute()
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod lock;
pub mod registry;
pub mod report;
pub mod rollback;
pub mod state;

pub use config::MigratorConfig;
pub use engine::Migrator;
pub use error::{BoxError, MigrationError, Result, StepError};
pub use history::{HistoryByUnit, HistoryEntry, HistoryStore};
pub use lock::{HolderToken, LockCoordinator, LockState, LockStatus, LockWait, LockWaitPolicy};
pub use registry::{
    ChangeStep, MigrationSource, MigrationUnit, StaticSource, StepFuture, StepInvoker, normalize,
};
pub use report::{MigrationReport, RunStatus, StepOutcome, StepRecord};
pub use rollback::RollbackExecutor;
pub use state::ExecutionState;
