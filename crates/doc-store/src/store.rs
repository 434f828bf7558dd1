use async_trait::async_trait;

use crate::{Document, IndexSpec, Result, UpdateOutcome, UpdateSpec};

/// Core trait for document store implementations.
///
/// Every operation touches a single collection, and every write is atomic
/// for a single document only. No operation spans several documents
/// atomically. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the documents of `collection` matching `filter`, in insertion order.
    ///
    /// A missing collection behaves like an empty one.
    async fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>>;

    /// Inserts a document.
    ///
    /// Fails with `DuplicateKey` if a unique index of the collection would be violated.
    async fn insert_one(&self, collection: &str, document: Document) -> Result<()>;

    /// Applies a conditional update to the first matching document, atomically.
    async fn update_one(&self, collection: &str, update: UpdateSpec) -> Result<UpdateOutcome>;

    /// Deletes the first document matching `filter`. Returns the number removed (0 or 1).
    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<u64>;

    /// Lists the secondary indexes of a collection.
    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>>;

    /// Creates an index. Creating an identical index again is a no-op.
    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<()>;

    /// Drops an index by name.
    async fn drop_index(&self, collection: &str, name: &str) -> Result<()>;

    /// Runs a raw administrative command, verbatim.
    ///
    /// The command dialect is defined by the backend.
    async fn run_command(&self, command: &str) -> Result<serde_json::Value>;
}

/// Extension trait providing convenience methods for document stores.
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    /// Returns every document of a collection.
    async fn find_all(&self, collection: &str) -> Result<Vec<Document>> {
        self.find(collection, &Document::new()).await
    }

    /// Returns the first document matching `filter`.
    async fn find_one(&self, collection: &str, filter: &Document) -> Result<Option<Document>> {
        Ok(self.find(collection, filter).await?.into_iter().next())
    }

    /// Counts the documents of a collection.
    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.find_all(collection).await?.len())
    }
}

// Blanket implementation for all DocumentStore implementations
impl<T: DocumentStore + ?Sized> DocumentStoreExt for T {}
