use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::{
    Document, IndexSpec, Result, StoreError, UpdateOutcome, UpdateSpec, matches_filter,
    store::DocumentStore, validate_name,
};

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    /// Finds a unique index that `candidate` would violate, ignoring the document at `skip`.
    fn violated_index(&self, candidate: &Document, skip: Option<usize>) -> Option<&IndexSpec> {
        self.indexes.iter().filter(|i| i.unique).find(|index| {
            let key = index.key_of(candidate);
            self.documents
                .iter()
                .enumerate()
                .any(|(pos, existing)| Some(pos) != skip && index.key_of(existing) == key)
        })
    }

    fn insert(&mut self, name: &str, document: Document) -> Result<()> {
        if let Some(index) = self.violated_index(&document, None) {
            return Err(StoreError::DuplicateKey {
                collection: name.to_string(),
                index: index.name.clone(),
            });
        }
        self.documents.push(document);
        Ok(())
    }

    fn update_at(&mut self, name: &str, pos: usize, set: &Document) -> Result<()> {
        let mut updated = self.documents[pos].clone();
        updated.extend(set.clone());
        if let Some(index) = self.violated_index(&updated, Some(pos)) {
            return Err(StoreError::DuplicateKey {
                collection: name.to_string(),
                index: index.name.clone(),
            });
        }
        self.documents[pos] = updated;
        Ok(())
    }

    fn has_duplicates_for(&self, index: &IndexSpec) -> bool {
        let keys: Vec<_> = self.documents.iter().map(|d| index.key_of(d)).collect();
        keys.iter()
            .enumerate()
            .any(|(i, key)| keys[i + 1..].contains(key))
    }
}

/// In-memory document store implementation for testing.
///
/// This implementation keeps all collections in memory and provides the
/// same interface as the PostgreSQL implementation. Clones share state, so
/// a clone handed to another task observes the same collections.
///
/// Raw commands are JSON objects:
///
/// - `{"ping": 1}`
/// - `{"drop": "<collection>"}`
/// - `{"insert": "<collection>", "documents": [{..}, ..]}`
/// - `{"delete": "<collection>", "filter": {..}}` (deletes every match)
/// - `{"update": "<collection>", "filter": {..}, "set": {..}}` (updates every match)
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    collections: Arc<RwLock<HashMap<String, Collection>>>,
    commands: Arc<RwLock<Vec<String>>>,
}

impl InMemoryDocumentStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every raw command received so far, in order.
    pub async fn executed_commands(&self) -> Vec<String> {
        self.commands.read().await.clone()
    }

    /// Returns the names of the existing collections, sorted.
    pub async fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.collections.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn object_field(spec: &Document, key: &str, command: &str) -> Result<Document> {
    match spec.get(key) {
        None => Ok(Document::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(StoreError::UnsupportedCommand(format!(
            "field {key:?} must be an object in {command}"
        ))),
    }
}

fn apply_command(
    collections: &mut HashMap<String, Collection>,
    spec: &Document,
    command: &str,
) -> Result<Value> {
    if spec.contains_key("ping") {
        return Ok(json!({"ok": 1}));
    }

    if let Some(name) = spec.get("drop").and_then(Value::as_str) {
        validate_name(name)?;
        let dropped = collections.remove(name).is_some();
        return Ok(json!({"ok": 1, "dropped": dropped}));
    }

    if let Some(name) = spec.get("insert").and_then(Value::as_str) {
        validate_name(name)?;
        let documents = spec
            .get("documents")
            .and_then(Value::as_array)
            .ok_or_else(|| StoreError::UnsupportedCommand(command.to_string()))?;
        let collection = collections.entry(name.to_string()).or_default();
        for document in documents {
            let Value::Object(document) = document else {
                return Err(StoreError::UnsupportedCommand(command.to_string()));
            };
            collection.insert(name, document.clone())?;
        }
        return Ok(json!({"ok": 1, "n": documents.len()}));
    }

    if let Some(name) = spec.get("delete").and_then(Value::as_str) {
        validate_name(name)?;
        let filter = object_field(spec, "filter", command)?;
        let removed = match collections.get_mut(name) {
            Some(collection) => {
                let before = collection.documents.len();
                collection.documents.retain(|d| !matches_filter(d, &filter));
                before - collection.documents.len()
            }
            None => 0,
        };
        return Ok(json!({"ok": 1, "n": removed}));
    }

    if let Some(name) = spec.get("update").and_then(Value::as_str) {
        validate_name(name)?;
        let filter = object_field(spec, "filter", command)?;
        let set = object_field(spec, "set", command)?;
        let mut updated = 0;
        if let Some(collection) = collections.get_mut(name) {
            let positions: Vec<usize> = collection
                .documents
                .iter()
                .enumerate()
                .filter(|(_, d)| matches_filter(d, &filter))
                .map(|(pos, _)| pos)
                .collect();
            for pos in positions {
                collection.update_at(name, pos, &set)?;
                updated += 1;
            }
        }
        return Ok(json!({"ok": 1, "n": updated}));
    }

    Err(StoreError::UnsupportedCommand(command.to_string()))
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>> {
        validate_name(collection)?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| {
                c.documents
                    .iter()
                    .filter(|d| matches_filter(d, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<()> {
        validate_name(collection)?;
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(collection, document)
    }

    async fn update_one(&self, collection: &str, update: UpdateSpec) -> Result<UpdateOutcome> {
        validate_name(collection)?;
        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();

        // The write lock is held across find and modify, which makes the update atomic.
        let position = target
            .documents
            .iter()
            .position(|d| matches_filter(d, &update.filter));

        match position {
            Some(pos) => {
                target.update_at(collection, pos, &update.set)?;
                Ok(UpdateOutcome {
                    matched: 1,
                    upserted: false,
                })
            }
            None if update.upsert => {
                target.insert(collection, update.upserted_document())?;
                Ok(UpdateOutcome {
                    matched: 0,
                    upserted: true,
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<u64> {
        validate_name(collection)?;
        let mut collections = self.collections.write().await;
        let Some(target) = collections.get_mut(collection) else {
            return Ok(0);
        };
        match target
            .documents
            .iter()
            .position(|d| matches_filter(d, filter))
        {
            Some(pos) => {
                target.documents.remove(pos);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        validate_name(collection)?;
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default())
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<()> {
        validate_name(collection)?;
        validate_name(&index.name)?;
        for key in &index.keys {
            validate_name(key)?;
        }

        let mut collections = self.collections.write().await;
        let target = collections.entry(collection.to_string()).or_default();

        if let Some(existing) = target.indexes.iter().find(|i| i.name == index.name) {
            if *existing == index {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                index: index.name,
            });
        }

        if index.unique && target.has_duplicates_for(&index) {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: index.name,
            });
        }

        target.indexes.push(index);
        Ok(())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        validate_name(collection)?;
        let mut collections = self.collections.write().await;
        let target = collections.get_mut(collection);
        let position = target
            .as_ref()
            .and_then(|c| c.indexes.iter().position(|i| i.name == name));

        match (target, position) {
            (Some(target), Some(pos)) => {
                target.indexes.remove(pos);
                Ok(())
            }
            _ => Err(StoreError::IndexNotFound {
                collection: collection.to_string(),
                index: name.to_string(),
            }),
        }
    }

    async fn run_command(&self, command: &str) -> Result<Value> {
        self.commands.write().await.push(command.to_string());

        let Value::Object(spec) = serde_json::from_str::<Value>(command)? else {
            return Err(StoreError::UnsupportedCommand(command.to_string()));
        };

        let mut collections = self.collections.write().await;
        apply_command(&mut collections, &spec, command)
    }
}
