use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, StoreError};

/// A JSON object stored in a collection.
pub type Document = serde_json::Map<String, Value>;

/// Longest identifier accepted for collections, schemas, indexes and fields.
const MAX_NAME_LEN: usize = 63;

/// Returns true if every field of `filter` equals the same field of `document`.
///
/// A filter value of `null` also matches a missing field. An empty filter
/// matches every document.
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key).unwrap_or(&Value::Null) == expected)
}

/// Checks that `name` is a plain identifier: ASCII letters, digits and
/// underscores, not starting with a digit, at most 63 characters.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_NAME_LEN {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Definition of a (possibly compound) ascending index over top-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name, unique within its collection.
    pub name: String,

    /// Indexed fields, in key order.
    pub keys: Vec<String>,

    /// Whether the index rejects duplicate key tuples.
    pub unique: bool,
}

impl IndexSpec {
    /// Creates a non-unique index over `keys`, named `<key>_1_<key>_1...`.
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        let name = keys
            .iter()
            .map(|k| format!("{k}_1"))
            .collect::<Vec<_>>()
            .join("_");
        Self {
            name,
            keys,
            unique: false,
        }
    }

    /// Marks the index as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Overrides the generated name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns true if this index is over exactly `keys`, in that order.
    pub fn covers(&self, keys: &[&str]) -> bool {
        self.keys.len() == keys.len() && self.keys.iter().zip(keys).all(|(a, b)| a == b)
    }

    /// Extracts the key tuple of `document` for this index.
    pub fn key_of<'a>(&self, document: &'a Document) -> Vec<&'a Value> {
        self.keys
            .iter()
            .map(|k| document.get(k).unwrap_or(&Value::Null))
            .collect()
    }
}

/// A single-document conditional update.
///
/// The first document matching `filter` receives the fields in `set`. When
/// nothing matches and `upsert` is set, a new document built from `filter`,
/// `set_on_insert` and `set` (later sources win) is inserted instead.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    pub filter: Document,
    pub set: Document,
    pub set_on_insert: Document,
    pub upsert: bool,
}

impl UpdateSpec {
    /// Creates an update for the first document matching `filter`.
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Adds an equality condition to the filter.
    pub fn filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Sets a field on the matched (or inserted) document.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(key.into(), value.into());
        self
    }

    /// Sets a field only when the update inserts a new document.
    pub fn set_on_insert(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_on_insert.insert(key.into(), value.into());
        self
    }

    /// Inserts a document when nothing matches.
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// Builds the document inserted by an upsert.
    pub fn upserted_document(&self) -> Document {
        let mut document = self.filter.clone();
        document.extend(self.set_on_insert.clone());
        document.extend(self.set.clone());
        document
    }
}

/// Result of an [`UpdateSpec`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Number of existing documents that matched the filter and were updated (0 or 1).
    pub matched: u64,

    /// Whether a new document was inserted.
    pub upserted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn filter_matches_equal_fields() {
        let document = doc(json!({"key": "LOCK", "status": "LOCKED", "n": 1}));
        assert!(matches_filter(&document, &doc(json!({"key": "LOCK"}))));
        assert!(matches_filter(&document, &doc(json!({"key": "LOCK", "n": 1}))));
        assert!(!matches_filter(&document, &doc(json!({"status": "UNLOCKED"}))));
        assert!(matches_filter(&document, &Document::new()));
    }

    #[test]
    fn null_filter_matches_missing_field() {
        let document = doc(json!({"key": "LOCK"}));
        assert!(matches_filter(&document, &doc(json!({"holder": null}))));
        assert!(!matches_filter(&document, &doc(json!({"holder": "x"}))));
    }

    #[test]
    fn arrays_must_match_exactly() {
        let document = doc(json!({"cmds": ["a", "b"]}));
        assert!(matches_filter(&document, &doc(json!({"cmds": ["a", "b"]}))));
        assert!(!matches_filter(&document, &doc(json!({"cmds": ["a"]}))));
    }

    #[test]
    fn validate_name_accepts_identifiers() {
        assert!(validate_name("dbchangelog").is_ok());
        assert!(validate_name("_lock_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1abc").is_err());
        assert!(validate_name("drop table;").is_err());
        assert!(validate_name("a\"b").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn index_spec_generates_name() {
        let index = IndexSpec::new(["change_id", "author"]).unique();
        assert_eq!(index.name, "change_id_1_author_1");
        assert!(index.unique);
        assert!(index.covers(&["change_id", "author"]));
        assert!(!index.covers(&["author", "change_id"]));
        assert!(!index.covers(&["change_id"]));
    }

    #[test]
    fn upserted_document_merges_sources() {
        let update = UpdateSpec::new(doc(json!({"key": "LOCK"})))
            .set_on_insert("status", "UNLOCKED")
            .set_on_insert("holder", Value::Null)
            .set("touched", true)
            .upsert();

        let inserted = update.upserted_document();
        assert_eq!(
            Value::Object(inserted),
            json!({"key": "LOCK", "status": "UNLOCKED", "holder": null, "touched": true})
        );
    }
}
