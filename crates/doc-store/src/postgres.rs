use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tokio::sync::RwLock;

use crate::{
    Document, IndexSpec, Result, StoreError, UpdateOutcome, UpdateSpec, store::DocumentStore,
    validate_name,
};

/// PostgreSQL-backed document store implementation.
///
/// Each collection is a table `"<schema>"."<collection>"` with a single
/// `doc JSONB` column plus an insertion sequence. Indexes are expression
/// indexes over `doc ->> '<field>'`, named `<collection>__<index>`.
/// Conditional updates are a single `UPDATE` statement, so they are atomic
/// per document. Raw commands are SQL, executed verbatim.
///
/// Schema, table and index DDL runs under a per-schema advisory lock, so
/// processes starting together against an empty database do not collide in
/// the system catalogs.
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    schema: String,
    known_collections: Arc<RwLock<HashSet<String>>>,
}

impl PostgresDocumentStore {
    /// Creates a store over `schema`, creating the schema if needed.
    pub async fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        validate_name(&schema)?;

        let mut tx = begin_ddl(&pool, &schema).await?;
        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{schema}""#))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Self {
            pool,
            schema,
            known_collections: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Connects to `database_url` and creates a store over `schema`.
    pub async fn connect(database_url: &str, schema: impl Into<String>) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Self::new(pool, schema).await
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Returns the schema holding the collection tables.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn table(&self, collection: &str) -> Result<String> {
        validate_name(collection)?;
        Ok(format!(r#""{}"."{}""#, self.schema, collection))
    }

    /// Returns the quoted table name, creating the table on first use.
    async fn ensure_collection(&self, collection: &str) -> Result<String> {
        let table = self.table(collection)?;
        if self.known_collections.read().await.contains(collection) {
            return Ok(table);
        }

        let mut tx = begin_ddl(&self.pool, &self.schema).await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (seq BIGSERIAL PRIMARY KEY, doc JSONB NOT NULL)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.known_collections
            .write()
            .await
            .insert(collection.to_string());
        Ok(table)
    }

    fn physical_index_name(collection: &str, name: &str) -> Result<String> {
        let physical = format!("{collection}__{name}");
        validate_name(&physical)?;
        Ok(physical)
    }

    fn row_to_document(row: PgRow) -> Result<Document> {
        let value: Value = row.try_get("doc")?;
        Ok(serde_json::from_value(value)?)
    }

    fn map_write_error(collection: &str, error: sqlx::Error) -> StoreError {
        if let sqlx::Error::Database(ref db_err) = error
            && db_err.is_unique_violation()
        {
            return StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: db_err.constraint().unwrap_or_default().to_string(),
            };
        }
        StoreError::Database(error)
    }
}

/// Builds ` WHERE ...` for an equality filter, numbering parameters from `first_param`.
///
/// Missing fields compare as JSON `null`.
fn where_clause(filter: &Document, first_param: usize) -> Result<(String, Vec<Value>)> {
    if filter.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut conditions = Vec::with_capacity(filter.len());
    let mut values = Vec::with_capacity(filter.len());
    for (offset, (key, value)) in filter.iter().enumerate() {
        validate_name(key)?;
        conditions.push(format!(
            "COALESCE(doc -> '{key}', 'null'::jsonb) = ${}",
            first_param + offset
        ));
        values.push(value.clone());
    }

    Ok((format!(" WHERE {}", conditions.join(" AND ")), values))
}

/// Begins a transaction holding the DDL advisory lock for `schema`.
///
/// The lock is released when the transaction commits or rolls back.
async fn begin_ddl(pool: &PgPool, schema: &str) -> Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("doc_store_ddl:{schema}"))
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Lists the non-primary indexes of `"<schema>"."<collection>"`.
async fn fetch_indexes(
    conn: &mut PgConnection,
    schema: &str,
    collection: &str,
) -> Result<Vec<IndexSpec>> {
    let prefix = format!("{collection}__");

    let rows = sqlx::query(
        r#"
        SELECT ic.relname AS name, i.indisunique AS is_unique,
               pg_get_indexdef(i.indexrelid) AS definition
        FROM pg_index i
        JOIN pg_class ic ON ic.oid = i.indexrelid
        JOIN pg_class tc ON tc.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = tc.relnamespace
        WHERE n.nspname = $1 AND tc.relname = $2 AND NOT i.indisprimary
        ORDER BY ic.relname ASC
        "#,
    )
    .bind(schema)
    .bind(collection)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<IndexSpec> {
            let name: String = row.try_get("name")?;
            let definition: String = row.try_get("definition")?;
            Ok(IndexSpec {
                name: name
                    .strip_prefix(&prefix)
                    .map(str::to_string)
                    .unwrap_or(name),
                keys: index_keys_from_definition(&definition),
                unique: row.try_get("is_unique")?,
            })
        })
        .collect()
}

/// Extracts the field names from an index definition such as
/// `CREATE UNIQUE INDEX x ON s.t USING btree (((doc ->> 'a'::text)), ((doc ->> 'b'::text)))`.
fn index_keys_from_definition(definition: &str) -> Vec<String> {
    definition
        .split("->> '")
        .skip(1)
        .filter_map(|segment| segment.split('\'').next())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>> {
        let table = self.ensure_collection(collection).await?;
        let (clause, values) = where_clause(filter, 1)?;

        let sql = format!("SELECT doc FROM {table}{clause} ORDER BY seq ASC");
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_document).collect()
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<()> {
        let table = self.ensure_collection(collection).await?;

        sqlx::query(&format!("INSERT INTO {table} (doc) VALUES ($1)"))
            .bind(Value::Object(document))
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_write_error(collection, e))?;

        Ok(())
    }

    async fn update_one(&self, collection: &str, update: UpdateSpec) -> Result<UpdateOutcome> {
        let table = self.ensure_collection(collection).await?;
        let (clause, values) = where_clause(&update.filter, 2)?;

        // The filter is repeated on the outer statement so that a concurrent
        // writer that changed the row first makes this update match nothing.
        let outer = if clause.is_empty() {
            String::new()
        } else {
            clause.replacen(" WHERE ", " AND ", 1)
        };
        let sql = format!(
            "UPDATE {table} SET doc = doc || $1 \
             WHERE seq = (SELECT seq FROM {table}{clause} ORDER BY seq ASC LIMIT 1){outer}"
        );

        let mut query = sqlx::query(&sql).bind(Value::Object(update.set.clone()));
        for value in values {
            query = query.bind(value);
        }

        let matched = query
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_write_error(collection, e))?
            .rows_affected();

        if matched > 0 || !update.upsert {
            return Ok(UpdateOutcome {
                matched,
                upserted: false,
            });
        }

        match self
            .insert_one(collection, update.upserted_document())
            .await
        {
            Ok(()) => Ok(UpdateOutcome {
                matched: 0,
                upserted: true,
            }),
            // Another writer upserted first; apply the update to its document instead.
            Err(StoreError::DuplicateKey { .. }) => {
                let retry = UpdateSpec {
                    upsert: false,
                    ..update
                };
                self.update_one(collection, retry).await
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> Result<u64> {
        let table = self.ensure_collection(collection).await?;
        let (clause, values) = where_clause(filter, 1)?;

        let sql = format!(
            "DELETE FROM {table} WHERE seq = (SELECT seq FROM {table}{clause} ORDER BY seq ASC LIMIT 1)"
        );
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }

        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>> {
        self.ensure_collection(collection).await?;
        let mut conn = self.pool.acquire().await?;
        fetch_indexes(&mut *conn, &self.schema, collection).await
    }

    async fn create_index(&self, collection: &str, index: IndexSpec) -> Result<()> {
        let table = self.ensure_collection(collection).await?;
        let physical = Self::physical_index_name(collection, &index.name)?;

        let mut columns = Vec::with_capacity(index.keys.len());
        for key in &index.keys {
            validate_name(key)?;
            columns.push(format!("(doc ->> '{key}')"));
        }
        let unique = if index.unique { "UNIQUE " } else { "" };

        // Check and create under one lock so a concurrent creator is observed.
        let mut tx = begin_ddl(&self.pool, &self.schema).await?;
        if let Some(existing) = fetch_indexes(&mut *tx, &self.schema, collection)
            .await?
            .into_iter()
            .find(|i| i.name == index.name)
        {
            if existing == index {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                index: index.name,
            });
        }

        sqlx::query(&format!(
            r#"CREATE {unique}INDEX "{physical}" ON {table} ({})"#,
            columns.join(", ")
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::map_write_error(collection, e))?;
        tx.commit().await?;

        tracing::debug!(collection, index = %index.name, unique = index.unique, "index created");
        Ok(())
    }

    async fn drop_index(&self, collection: &str, name: &str) -> Result<()> {
        self.ensure_collection(collection).await?;
        let physical = Self::physical_index_name(collection, name)?;

        let mut tx = begin_ddl(&self.pool, &self.schema).await?;
        let exists = fetch_indexes(&mut *tx, &self.schema, collection)
            .await?
            .iter()
            .any(|i| i.name == name);
        if !exists {
            return Err(StoreError::IndexNotFound {
                collection: collection.to_string(),
                index: name.to_string(),
            });
        }

        sqlx::query(&format!(r#"DROP INDEX "{}"."{physical}""#, self.schema))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<Value> {
        let result = sqlx::raw_sql(command).execute(&self.pool).await?;
        Ok(json!({"ok": 1, "rows_affected": result.rows_affected()}))
    }
}
