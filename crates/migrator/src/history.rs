//! Durable record of applied change steps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use doc_store::{Document, DocumentStore, DocumentStoreExt, IndexSpec, StoreError};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::registry::{ChangeStep, MigrationUnit};

/// Field holding the change id in history documents.
pub const CHANGE_ID_KEY: &str = "change_id";

/// Field holding the author in history documents.
pub const AUTHOR_KEY: &str = "author";

/// A change step that has been applied, as stored in the history collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub change_id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    /// Name of the owning migration unit.
    pub unit_name: String,
    pub step_name: String,
    /// Snapshot of the step's rollback commands at apply time.
    #[serde(default)]
    pub rollback_commands: Vec<String>,
}

impl HistoryEntry {
    /// Creates the entry recording that `step` of `unit` was applied now.
    pub fn for_step(unit: &MigrationUnit, step: &ChangeStep) -> Self {
        Self {
            change_id: step.id.clone(),
            author: step.author.clone(),
            timestamp: Utc::now(),
            unit_name: unit.name.clone(),
            step_name: step.name.clone(),
            rollback_commands: step.rollback_commands.clone(),
        }
    }

    /// Serializes the entry into the document stored in the collection.
    pub fn to_document(&self) -> Result<Document> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }

    /// Parses a stored document.
    pub fn from_document(document: Document) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(document))?)
    }
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} ({}::{}, {})",
            self.change_id, self.author, self.unit_name, self.step_name, self.timestamp
        )
    }
}

/// Applied-step history grouped by unit name, newest entry first in each group.
pub type HistoryByUnit = BTreeMap<String, Vec<HistoryEntry>>;

/// Reads and writes history entries in one collection of a document store.
///
/// The pair (change id, author) is unique across the collection, enforced by
/// a unique compound index that [`HistoryStore::ensure_index`] keeps in place.
#[derive(Debug, Clone)]
pub struct HistoryStore<S> {
    store: S,
    collection: String,
}

impl<S: DocumentStore> HistoryStore<S> {
    pub fn new(store: S, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    /// Returns the history collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Makes sure the unique (change id, author) index exists.
    ///
    /// A missing index is created; an existing non-unique one is dropped and
    /// recreated as unique.
    #[tracing::instrument(skip(self), fields(collection = %self.collection))]
    pub async fn ensure_index(&self) -> Result<()> {
        let required = [CHANGE_ID_KEY, AUTHOR_KEY];
        let existing = self
            .store
            .list_indexes(&self.collection)
            .await?
            .into_iter()
            .find(|index| index.covers(&required));

        match existing {
            None => {
                self.store
                    .create_index(&self.collection, IndexSpec::new(required).unique())
                    .await?;
                tracing::debug!("history index created");
            }
            Some(index) if !index.unique => {
                match self.store.drop_index(&self.collection, &index.name).await {
                    // Another process dropped it first.
                    Ok(()) | Err(StoreError::IndexNotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                self.store
                    .create_index(&self.collection, IndexSpec::new(required).unique())
                    .await?;
                tracing::debug!(dropped = %index.name, "history index recreated as unique");
            }
            Some(_) => {}
        }

        Ok(())
    }

    /// Loads every entry, grouped by unit name, newest first within each unit.
    pub async fn load_all(&self) -> Result<HistoryByUnit> {
        let mut entries = self
            .store
            .find_all(&self.collection)
            .await?
            .into_iter()
            .map(HistoryEntry::from_document)
            .collect::<Result<Vec<_>>>()?;

        // Reverse insertion order first so equal timestamps also come out newest first.
        entries.reverse();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut grouped = HistoryByUnit::new();
        for entry in entries {
            tracing::debug!(%entry, "found history entry");
            grouped
                .entry(entry.unit_name.clone())
                .or_default()
                .push(entry);
        }
        Ok(grouped)
    }

    /// Inserts a new entry.
    ///
    /// An entry with the same (change id, author) fails with a duplicate-key store error.
    pub async fn save(&self, entry: &HistoryEntry) -> Result<()> {
        tracing::debug!(%entry, "saving history entry");
        self.store
            .insert_one(&self.collection, entry.to_document()?)
            .await?;
        Ok(())
    }

    /// Removes the stored entry matching every field of `entry`.
    ///
    /// Returns the number of removed entries (0 or 1).
    pub async fn delete(&self, entry: &HistoryEntry) -> Result<u64> {
        Ok(self
            .store
            .delete_one(&self.collection, &entry.to_document()?)
            .await?)
    }

    /// Counts the stored entries.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.count(&self.collection).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use doc_store::InMemoryDocumentStore;

    use crate::MigrationError;

    fn entry(change_id: &str, unit: &str, minutes_ago: i64) -> HistoryEntry {
        HistoryEntry {
            change_id: change_id.to_string(),
            author: "tester".to_string(),
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
            unit_name: unit.to_string(),
            step_name: change_id.to_string(),
            rollback_commands: vec![format!(r#"{{"drop": "{change_id}"}}"#)],
        }
    }

    fn history(store: &InMemoryDocumentStore) -> HistoryStore<InMemoryDocumentStore> {
        HistoryStore::new(store.clone(), "dbchangelog")
    }

    #[tokio::test]
    async fn load_all_on_empty_collection() {
        let store = InMemoryDocumentStore::new();
        let loaded = history(&store).load_all().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn load_all_groups_newest_first() {
        let store = InMemoryDocumentStore::new();
        let history = history(&store);

        history.save(&entry("a1", "unit_a", 30)).await.unwrap();
        history.save(&entry("b1", "unit_b", 20)).await.unwrap();
        history.save(&entry("a2", "unit_a", 10)).await.unwrap();

        let loaded = history.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);

        let ids: Vec<_> = loaded["unit_a"].iter().map(|e| e.change_id.as_str()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
        assert_eq!(loaded["unit_b"].len(), 1);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_newest_insert_first() {
        let store = InMemoryDocumentStore::new();
        let history = history(&store);

        let mut first = entry("x1", "unit", 0);
        let mut second = entry("x2", "unit", 0);
        second.timestamp = first.timestamp;
        first.step_name = "first".to_string();
        history.save(&first).await.unwrap();
        history.save(&second).await.unwrap();

        let loaded = history.load_all().await.unwrap();
        assert_eq!(loaded["unit"][0].change_id, "x2");
    }

    #[tokio::test]
    async fn saved_entry_round_trips() {
        let store = InMemoryDocumentStore::new();
        let history = history(&store);
        let original = entry("001", "unit", 1);

        history.save(&original).await.unwrap();

        let loaded = history.load_all().await.unwrap();
        assert_eq!(loaded["unit"], vec![original]);
    }

    #[tokio::test]
    async fn duplicate_entry_rejected_once_indexed() {
        let store = InMemoryDocumentStore::new();
        let history = history(&store);
        history.ensure_index().await.unwrap();

        history.save(&entry("001", "unit", 2)).await.unwrap();
        let result = history.save(&entry("001", "other_unit", 1)).await;

        assert!(matches!(
            result,
            Err(MigrationError::Store(StoreError::DuplicateKey { .. }))
        ));
        assert_eq!(history.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ensure_index_creates_unique_index() {
        let store = InMemoryDocumentStore::new();
        history(&store).ensure_index().await.unwrap();

        let indexes = store.list_indexes("dbchangelog").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].unique);
        assert!(indexes[0].covers(&[CHANGE_ID_KEY, AUTHOR_KEY]));

        // Idempotent.
        history(&store).ensure_index().await.unwrap();
        assert_eq!(store.list_indexes("dbchangelog").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_index_replaces_non_unique_index() {
        let store = InMemoryDocumentStore::new();
        store
            .create_index("dbchangelog", IndexSpec::new([CHANGE_ID_KEY, AUTHOR_KEY]))
            .await
            .unwrap();

        history(&store).ensure_index().await.unwrap();

        let indexes = store.list_indexes("dbchangelog").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].unique);
    }

    #[tokio::test]
    async fn delete_matches_the_full_entry() {
        let store = InMemoryDocumentStore::new();
        let history = history(&store);
        let stored = entry("001", "unit", 1);
        history.save(&stored).await.unwrap();

        let mut stale = stored.clone();
        stale.rollback_commands.clear();
        assert_eq!(history.delete(&stale).await.unwrap(), 0);

        assert_eq!(history.delete(&stored).await.unwrap(), 1);
        assert_eq!(history.count().await.unwrap(), 0);
    }
}
