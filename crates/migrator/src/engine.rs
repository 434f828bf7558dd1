//! The migration engine.

use std::collections::HashSet;
use std::sync::Arc;

use doc_store::{DocumentStore, PostgresDocumentStore};

use crate::config::MigratorConfig;
use crate::error::{MigrationError, Result, StepError};
use crate::history::{HistoryByUnit, HistoryEntry, HistoryStore};
use crate::lock::LockCoordinator;
use crate::registry::{ChangeStep, MigrationSource, MigrationUnit, normalize};
use crate::report::{MigrationReport, RunStatus, StepOutcome};
use crate::rollback::RollbackExecutor;
use crate::state::ExecutionState;

/// Applies registered migration units to a document store, once per change id.
///
/// Only one process runs migrations at a time: the run happens under the
/// lock held in the lock collection, and the lock is released on every exit
/// path once taken.
///
/// ```ignore
/// let report = Migrator::new(MigratorConfig::new("appdb"))
///     .with_source(StaticSource::new().unit(users_unit()))
///     .with_store(store)
///     .execute()
///     .await?;
/// ```
pub struct Migrator<S> {
    config: MigratorConfig,
    source: Option<Arc<dyn MigrationSource>>,
    store: Option<S>,
}

impl<S> Migrator<S>
where
    S: DocumentStore + Clone + 'static,
{
    /// Creates an engine with no source and no store attached.
    pub fn new(config: MigratorConfig) -> Self {
        Self {
            config,
            source: None,
            store: None,
        }
    }

    /// Sets the provider of migration units.
    pub fn with_source(mut self, source: impl MigrationSource + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Attaches the store handle.
    pub fn with_store(mut self, store: S) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    fn store(&self) -> Result<&S> {
        self.store.as_ref().ok_or_else(|| {
            MigrationError::Connection("no document store attached to the migrator".to_string())
        })
    }

    /// Returns a lock coordinator over the configured lock collection.
    pub fn lock_coordinator(&self) -> Result<LockCoordinator<S>> {
        Ok(LockCoordinator::new(
            self.store()?.clone(),
            self.config.lock_collection.clone(),
        ))
    }

    /// Returns the history store over the configured history collection.
    pub fn history_store(&self) -> Result<HistoryStore<S>> {
        Ok(HistoryStore::new(
            self.store()?.clone(),
            self.config.history_collection.clone(),
        ))
    }

    /// Returns true if some process currently holds the migration lock.
    pub async fn is_execution_in_progress(&self) -> Result<bool> {
        self.lock_coordinator()?.is_held().await
    }

    /// Runs the migrations.
    ///
    /// Returns a report when the run completes, when the engine is disabled,
    /// or when the lock is busy and `fail_on_lock_contention` is off.
    #[tracing::instrument(skip(self), fields(database = ?self.config.database))]
    pub async fn execute(&self) -> Result<MigrationReport> {
        let started = std::time::Instant::now();
        let mut state = ExecutionState::Init;

        if !self.config.enabled {
            advance(&mut state, ExecutionState::Disabled);
            tracing::info!("migrator is disabled, exiting");
            return Ok(MigrationReport::with_status(RunStatus::Disabled));
        }

        let result = self.drive(&mut state).await;
        metrics::histogram!("migration_run_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(report) => tracing::info!(
                status = ?report.status,
                applied = report.applied(),
                reapplied = report.reapplied(),
                skipped = report.skipped(),
                rolled_back = report.rolled_back(),
                "migrator finished"
            ),
            Err(error) => {
                tracing::error!(%error, failed_in = %state, "migration run failed");
                advance(&mut state, ExecutionState::Failed);
            }
        }
        result
    }

    async fn drive(&self, state: &mut ExecutionState) -> Result<MigrationReport> {
        advance(state, ExecutionState::Validate);
        let units = self.validate()?;

        advance(state, ExecutionState::Connect);
        let store = self.store()?.clone();
        let history = HistoryStore::new(store.clone(), self.config.history_collection.clone());
        let lock = LockCoordinator::new(store.clone(), self.config.lock_collection.clone());
        history.ensure_index().await?;
        lock.initialize().await?;

        advance(state, ExecutionState::AcquireLock);
        if !self.config.lock_wait_policy().acquire(&lock).await? {
            if self.config.fail_on_lock_contention {
                return Err(MigrationError::LockAcquire(format!(
                    "lock in collection {} is held by another process",
                    self.config.lock_collection
                )));
            }
            tracing::info!("migration lock not acquired, exiting");
            advance(state, ExecutionState::Done);
            return Ok(MigrationReport::with_status(RunStatus::LockNotAcquired));
        }
        tracing::info!(token = %lock.token(), "migration lock acquired, starting migrations");

        advance(state, ExecutionState::Run);
        let run = self.run(&store, &history, &units).await;

        advance(state, ExecutionState::ReleaseLock);
        let released = lock.release().await;
        match &released {
            Ok(true) => tracing::info!("migration lock released"),
            Ok(false) => tracing::warn!("migration lock was no longer held by this process"),
            Err(error) => tracing::error!(%error, "failed to release migration lock"),
        }

        // A run error wins over a release error.
        let report = run?;
        released?;
        advance(state, ExecutionState::Done);
        Ok(report)
    }

    fn validate(&self) -> Result<Vec<MigrationUnit>> {
        if self
            .config
            .database
            .as_deref()
            .is_none_or(|name| name.trim().is_empty())
        {
            return Err(MigrationError::Configuration(
                "database name is not set".to_string(),
            ));
        }

        let Some(source) = &self.source else {
            return Err(MigrationError::Configuration(
                "migration source is not set".to_string(),
            ));
        };

        normalize(source.units()?)
    }

    async fn run(
        &self,
        store: &S,
        history: &HistoryStore<S>,
        units: &[MigrationUnit],
    ) -> Result<MigrationReport> {
        let mut report = MigrationReport::with_status(RunStatus::Completed);
        let mut recorded = history.load_all().await?;
        let rollback = RollbackExecutor::new(store.clone(), history.clone());
        let handle: Arc<dyn DocumentStore> = Arc::new(store.clone());

        if self.config.rollback_enabled {
            self.rollback_removed_units(&rollback, &mut recorded, units, &mut report)
                .await?;
        }

        for unit in units {
            let entries = recorded.remove(&unit.name).unwrap_or_default();

            if self.config.rollback_enabled && entries.len() > unit.steps.len() {
                tracing::info!(unit = %unit.name, "unit lost steps, rolling back removed ones");
                for entry in &entries {
                    if unit.steps.iter().any(|step| step.id == entry.change_id) {
                        tracing::debug!(%entry, "still declared, rollback skipped");
                        continue;
                    }
                    rollback.rollback(entry).await?;
                    report.record(
                        &entry.unit_name,
                        &entry.change_id,
                        &entry.author,
                        StepOutcome::RolledBack,
                    );
                }
                continue;
            }

            tracing::info!(unit = %unit.name, steps = unit.steps.len(), "applying unit");
            for step in &unit.steps {
                let outcome = self
                    .apply_step(unit, step, &entries, history, &handle)
                    .await?;
                report.record(&unit.name, &step.id, &step.author, outcome);
            }
        }

        Ok(report)
    }

    /// Rolls back every history entry of units that are no longer declared.
    async fn rollback_removed_units(
        &self,
        rollback: &RollbackExecutor<S>,
        recorded: &mut HistoryByUnit,
        units: &[MigrationUnit],
        report: &mut MigrationReport,
    ) -> Result<()> {
        let declared: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
        let removed: Vec<String> = recorded
            .keys()
            .filter(|name| !declared.contains(name.as_str()))
            .cloned()
            .collect();

        for name in removed {
            let entries = recorded.remove(&name).unwrap_or_default();
            tracing::info!(unit = %name, entries = entries.len(), "unit no longer declared, rolling back");
            for entry in &entries {
                rollback.rollback(entry).await?;
                report.record(
                    &entry.unit_name,
                    &entry.change_id,
                    &entry.author,
                    StepOutcome::RolledBack,
                );
            }
        }
        Ok(())
    }

    async fn apply_step(
        &self,
        unit: &MigrationUnit,
        step: &ChangeStep,
        entries: &[HistoryEntry],
        history: &HistoryStore<S>,
        handle: &Arc<dyn DocumentStore>,
    ) -> Result<StepOutcome> {
        let already_applied = entries.iter().any(|entry| entry.change_id == step.id);

        if already_applied && !step.run_always {
            tracing::info!(change_id = %step.id, author = %step.author, "skipped");
            metrics::counter!("migrations_skipped_total").increment(1);
            return Ok(StepOutcome::Skipped);
        }

        match step.invoker.invoke(handle.clone()).await {
            Ok(()) => {}
            Err(StepError::Contract(reason)) => {
                tracing::error!(change_id = %step.id, %reason, "change step contract violated");
                return Ok(StepOutcome::ContractViolation { reason });
            }
            Err(StepError::Failed(source)) => {
                return Err(MigrationError::Invocation {
                    change_id: step.id.clone(),
                    source,
                });
            }
        }

        if already_applied {
            tracing::info!(change_id = %step.id, author = %step.author, "reapplied");
            metrics::counter!("migrations_reapplied_total").increment(1);
            return Ok(StepOutcome::Reapplied);
        }

        history.save(&HistoryEntry::for_step(unit, step)).await?;
        tracing::info!(change_id = %step.id, author = %step.author, "applied");
        metrics::counter!("migrations_applied_total").increment(1);
        Ok(StepOutcome::Applied)
    }
}

impl Migrator<PostgresDocumentStore> {
    /// Connects to PostgreSQL using `database_url`, storing collections in the
    /// schema named by `database`.
    pub async fn connect(config: MigratorConfig) -> Result<Self> {
        let Some(url) = config.database_url.clone() else {
            return Err(MigrationError::Configuration(
                "database url is not set".to_string(),
            ));
        };
        let Some(schema) = config.database.clone() else {
            return Err(MigrationError::Configuration(
                "database name is not set".to_string(),
            ));
        };

        let store = PostgresDocumentStore::connect(&url, schema).await?;
        Ok(Self::new(config).with_store(store))
    }
}

fn advance(state: &mut ExecutionState, next: ExecutionState) {
    debug_assert!(
        state.can_transition_to(next),
        "invalid transition {state} -> {next}"
    );
    tracing::debug!(from = %state, to = %next, "execution state changed");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticSource;
    use doc_store::InMemoryDocumentStore;

    fn migrator(config: MigratorConfig) -> Migrator<InMemoryDocumentStore> {
        Migrator::new(config)
    }

    #[tokio::test]
    async fn disabled_engine_touches_nothing() {
        let store = InMemoryDocumentStore::new();
        let report = migrator(MigratorConfig::new("appdb").with_enabled(false))
            .with_store(store.clone())
            .execute()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Disabled);
        assert!(store.collection_names().await.is_empty());
    }

    #[tokio::test]
    async fn missing_database_is_a_configuration_error() {
        let result = migrator(MigratorConfig::default())
            .with_source(StaticSource::new())
            .with_store(InMemoryDocumentStore::new())
            .execute()
            .await;
        assert!(matches!(result, Err(MigrationError::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_source_is_a_configuration_error() {
        let result = migrator(MigratorConfig::new("appdb"))
            .with_store(InMemoryDocumentStore::new())
            .execute()
            .await;
        assert!(matches!(result, Err(MigrationError::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_store_is_a_connection_error() {
        let engine = migrator(MigratorConfig::new("appdb")).with_source(StaticSource::new());
        assert!(matches!(
            engine.execute().await,
            Err(MigrationError::Connection(_))
        ));
        assert!(matches!(
            engine.is_execution_in_progress().await,
            Err(MigrationError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn connect_requires_url_and_database() {
        let result = Migrator::<PostgresDocumentStore>::connect(MigratorConfig::new("appdb")).await;
        assert!(matches!(result, Err(MigrationError::Configuration(_))));

        let config = MigratorConfig::default().with_database_url("postgres://x");
        let result = Migrator::<PostgresDocumentStore>::connect(config).await;
        assert!(matches!(result, Err(MigrationError::Configuration(_))));
    }

    #[tokio::test]
    async fn empty_source_completes_and_releases_lock() {
        let store = InMemoryDocumentStore::new();
        let engine = migrator(MigratorConfig::new("appdb"))
            .with_source(StaticSource::new())
            .with_store(store.clone());

        let report = engine.execute().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert!(report.steps.is_empty());
        assert!(!engine.is_execution_in_progress().await.unwrap());
    }
}
