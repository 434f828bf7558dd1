//! Undo of change steps whose declaration was removed.

use doc_store::DocumentStore;

use crate::error::{MigrationError, Result};
use crate::history::{HistoryEntry, HistoryStore};

/// Runs the rollback commands stored in a history entry, then forgets the entry.
#[derive(Debug, Clone)]
pub struct RollbackExecutor<S> {
    store: S,
    history: HistoryStore<S>,
}

impl<S: DocumentStore + Clone> RollbackExecutor<S> {
    pub fn new(store: S, history: HistoryStore<S>) -> Self {
        Self { store, history }
    }

    /// Rolls back one entry.
    ///
    /// Commands run verbatim, in stored order. The first failing command aborts
    /// with [`MigrationError::Rollback`]; commands that already ran are not
    /// undone and the entry stays in history.
    #[tracing::instrument(skip(self, entry), fields(change_id = %entry.change_id, unit = %entry.unit_name))]
    pub async fn rollback(&self, entry: &HistoryEntry) -> Result<()> {
        for command in &entry.rollback_commands {
            tracing::debug!(%command, "running rollback command");
            self.store
                .run_command(command)
                .await
                .map_err(|source| MigrationError::Rollback {
                    change_id: entry.change_id.clone(),
                    command: command.clone(),
                    source,
                })?;
        }

        let removed = self.history.delete(entry).await?;
        if removed == 0 {
            tracing::warn!("rolled back entry was already gone from history");
        }
        metrics::counter!("migrations_rolled_back_total").increment(1);
        tracing::info!(
            commands = entry.rollback_commands.len(),
            "change step rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use doc_store::{DocumentStoreExt, InMemoryDocumentStore, StoreError};

    fn entry(commands: &[&str]) -> HistoryEntry {
        HistoryEntry {
            change_id: "001".to_string(),
            author: "tester".to_string(),
            timestamp: Utc::now(),
            unit_name: "unit".to_string(),
            step_name: "create_users".to_string(),
            rollback_commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn executor(store: &InMemoryDocumentStore) -> RollbackExecutor<InMemoryDocumentStore> {
        let history = HistoryStore::new(store.clone(), "dbchangelog");
        RollbackExecutor::new(store.clone(), history)
    }

    #[tokio::test]
    async fn runs_commands_in_order_then_deletes() {
        let store = InMemoryDocumentStore::new();
        let entry = entry(&[r#"{"drop": "users"}"#, r#"{"ping": 1}"#]);
        HistoryStore::new(store.clone(), "dbchangelog")
            .save(&entry)
            .await
            .unwrap();

        executor(&store).rollback(&entry).await.unwrap();

        assert_eq!(
            store.executed_commands().await,
            vec![r#"{"drop": "users"}"#.to_string(), r#"{"ping": 1}"#.to_string()]
        );
        assert_eq!(store.count("dbchangelog").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_command_list_only_deletes() {
        let store = InMemoryDocumentStore::new();
        let entry = entry(&[]);
        HistoryStore::new(store.clone(), "dbchangelog")
            .save(&entry)
            .await
            .unwrap();

        executor(&store).rollback(&entry).await.unwrap();

        assert!(store.executed_commands().await.is_empty());
        assert_eq!(store.count("dbchangelog").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_command_keeps_entry() {
        let store = InMemoryDocumentStore::new();
        let entry = entry(&[r#"{"ping": 1}"#, r#"{"explode": true}"#, r#"{"ping": 2}"#]);
        HistoryStore::new(store.clone(), "dbchangelog")
            .save(&entry)
            .await
            .unwrap();

        let result = executor(&store).rollback(&entry).await;

        match result {
            Err(MigrationError::Rollback {
                change_id,
                command,
                source: StoreError::UnsupportedCommand(_),
            }) => {
                assert_eq!(change_id, "001");
                assert_eq!(command, r#"{"explode": true}"#);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The third command never ran and the entry is still recorded.
        assert_eq!(store.executed_commands().await.len(), 2);
        assert_eq!(store.count("dbchangelog").await.unwrap(), 1);
    }
}
