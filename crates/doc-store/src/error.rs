use thiserror::Error;

/// Errors that can occur when interacting with a document store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write would have violated a unique index.
    #[error("Duplicate key in collection {collection}: unique index {index} violated")]
    DuplicateKey { collection: String, index: String },

    /// A collection, schema, index or field name is not a plain identifier.
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    /// An index with the same name but a different definition already exists.
    #[error("Index {index} on collection {collection} already exists with different options")]
    IndexConflict { collection: String, index: String },

    /// The requested index does not exist.
    #[error("Index {index} not found on collection {collection}")]
    IndexNotFound { collection: String, index: String },

    /// A raw command was not understood by the backend.
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for document store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
