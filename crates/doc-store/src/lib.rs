//! Document store abstraction used by the migration engine.
//!
//! A store is a set of named collections holding JSON documents. The
//! [`DocumentStore`] trait exposes collection CRUD, single-document atomic
//! conditional updates, index maintenance and raw administrative commands.
//! Two backends are provided: [`InMemoryDocumentStore`] for tests and
//! embedding, and [`PostgresDocumentStore`] which keeps each collection in a
//! JSONB table.

pub mod document;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use document::{Document, IndexSpec, UpdateOutcome, UpdateSpec, matches_filter, validate_name};
pub use error::{Result, StoreError};
pub use memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;
pub use store::{DocumentStore, DocumentStoreExt};
