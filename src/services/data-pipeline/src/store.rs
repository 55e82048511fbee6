//! Relational store access used as an extraction source and ETL load target
//!
//! [`RelationalStore`] is the seam between the core and the database. The
//! PostgreSQL implementation binds each record as one `jsonb` parameter and lets
//! `jsonb_populate_record` cast fields to the column types of the target table.
//! [`InMemoryStore`] backs tests and the CLI dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool, Postgres, Transaction,
};
use tracing::{debug, info};

use crate::{
    error::{PipelineError, Result},
    types::Record,
};

/// Read access plus transaction factory
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Run a read query and return each row as a record
    async fn fetch(
        &self,
        query: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Record>>;

    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Release pooled connections
    async fn close(&self);
}

/// Write operations inside one transaction
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn insert(&mut self, table: &str, record: &Record) -> Result<()>;

    /// Whether a row with the same key column values exists
    async fn exists(&mut self, table: &str, key_columns: &[String], record: &Record)
        -> Result<bool>;

    /// Update rows matching the key columns, returning the affected count
    async fn update(&mut self, table: &str, key_columns: &[String], record: &Record)
        -> Result<u64>;

    async fn delete_all(&mut self, table: &str) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// PostgreSQL store on a sqlx pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a new pool from a connection URL
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        Self::connect_with(
            Self::parse_url(database_url)?,
            max_connections,
            acquire_timeout,
        )
        .await
    }

    /// Connect a new pool from prepared options
    pub async fn connect_with(
        options: PgConnectOptions,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        info!(max_connections, "Connected relational store");
        Ok(Self { pool })
    }

    /// Parse a `postgres://` URL
    pub fn parse_url(database_url: &str) -> Result<PgConnectOptions> {
        database_url
            .parse::<PgConnectOptions>()
            .map_err(|e| PipelineError::configuration(format!("Invalid database URL: {}", e)))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RelationalStore for PgStore {
    async fn fetch(
        &self,
        query: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Record>> {
        let mut sql = format!(
            "SELECT row_to_json(source_rows)::jsonb FROM ({}) AS source_rows",
            query.trim().trim_end_matches(';')
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        let rows = sqlx::query_scalar::<_, Value>(&sql)
            .fetch_all(&self.pool)
            .await?;

        debug!(rows = rows.len(), "Fetched rows");
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        let table_ident = quote_table(table)?;
        let columns = quote_columns(record.keys())?;
        let sql = format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)",
            table = table_ident,
            columns = columns,
        );

        sqlx::query(&sql)
            .bind(Value::Object(record.clone()))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| PipelineError::load(table, e.to_string()))?;
        Ok(())
    }

    async fn exists(
        &mut self,
        table: &str,
        key_columns: &[String],
        record: &Record,
    ) -> Result<bool> {
        let table_ident = quote_table(table)?;
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {table} AS t, jsonb_populate_record(NULL::{table}, $1) AS r WHERE {predicate})",
            table = table_ident,
            predicate = key_predicate(key_columns)?,
        );

        let found = sqlx::query_scalar::<_, bool>(&sql)
            .bind(Value::Object(record.clone()))
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| PipelineError::load(table, e.to_string()))?;
        Ok(found)
    }

    async fn update(
        &mut self,
        table: &str,
        key_columns: &[String],
        record: &Record,
    ) -> Result<u64> {
        let table_ident = quote_table(table)?;
        let assignments = record
            .keys()
            .filter(|column| !key_columns.contains(*column))
            .map(|column| {
                let ident = quote_ident(column)?;
                Ok(format!("{ident} = r.{ident}"))
            })
            .collect::<Result<Vec<_>>>()?;

        if assignments.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {table} AS t SET {assignments} FROM jsonb_populate_record(NULL::{table}, $1) AS r WHERE {predicate}",
            table = table_ident,
            assignments = assignments.join(", "),
            predicate = key_predicate(key_columns)?,
        );

        let result = sqlx::query(&sql)
            .bind(Value::Object(record.clone()))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| PipelineError::load(table, e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&mut self, table: &str) -> Result<u64> {
        let sql = format!("DELETE FROM {}", quote_table(table)?);
        let result = sqlx::query(&sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| PipelineError::load(table, e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Quote one identifier, rejecting empty names and embedded NULs
fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(PipelineError::validation(name, "Invalid SQL identifier"));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a possibly schema-qualified table name
fn quote_table(table: &str) -> Result<String> {
    table
        .split('.')
        .map(quote_ident)
        .collect::<Result<Vec<_>>>()
        .map(|parts| parts.join("."))
}

fn quote_columns<'a>(columns: impl Iterator<Item = &'a String>) -> Result<String> {
    let quoted = columns
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    if quoted.is_empty() {
        return Err(PipelineError::validation("record", "Record has no columns"));
    }
    Ok(quoted.join(", "))
}

fn key_predicate(key_columns: &[String]) -> Result<String> {
    if key_columns.is_empty() {
        return Err(PipelineError::configuration(
            "Key columns are required for keyed operations",
        ));
    }
    key_columns
        .iter()
        .map(|column| {
            let ident = quote_ident(column)?;
            Ok(format!("t.{ident} = r.{ident}"))
        })
        .collect::<Result<Vec<_>>>()
        .map(|parts| parts.join(" AND "))
}

/// In-process store keyed by table name
///
/// `fetch` treats the query as a table name. Transactions stage a private copy
/// of each table they touch and publish it on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<HashMap<String, Vec<Record>>>>,
    failing_tables: Arc<RwLock<HashSet<String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a table
    pub fn seed(&self, table: &str, rows: Vec<Record>) {
        self.tables.write().insert(table.to_string(), rows);
    }

    /// Committed rows of a table
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Make every write to `table` fail, for rollback tests
    pub fn fail_writes_to(&self, table: &str) {
        self.failing_tables.write().insert(table.to_string());
    }
}

#[async_trait]
impl RelationalStore for InMemoryStore {
    async fn fetch(
        &self,
        query: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Record>> {
        let tables = self.tables.read();
        let rows = tables
            .get(query.trim())
            .ok_or_else(|| PipelineError::not_found("table", query.trim()))?;

        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(usize::MAX);
        Ok(rows.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            staged: HashMap::new(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

struct InMemoryTransaction {
    store: InMemoryStore,
    staged: HashMap<String, Vec<Record>>,
}

impl InMemoryTransaction {
    fn table(&mut self, table: &str) -> Result<&mut Vec<Record>> {
        if self.store.failing_tables.read().contains(table) {
            return Err(PipelineError::load(table, "write rejected"));
        }
        let store = &self.store;
        Ok(self
            .staged
            .entry(table.to_string())
            .or_insert_with(|| store.rows(table)))
    }
}

fn keys_match(row: &Record, record: &Record, key_columns: &[String]) -> bool {
    key_columns
        .iter()
        .all(|column| row.get(column).is_some() && row.get(column) == record.get(column))
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn insert(&mut self, table: &str, record: &Record) -> Result<()> {
        self.table(table)?.push(record.clone());
        Ok(())
    }

    async fn exists(
        &mut self,
        table: &str,
        key_columns: &[String],
        record: &Record,
    ) -> Result<bool> {
        Ok(self
            .table(table)?
            .iter()
            .any(|row| keys_match(row, record, key_columns)))
    }

    async fn update(
        &mut self,
        table: &str,
        key_columns: &[String],
        record: &Record,
    ) -> Result<u64> {
        let mut affected = 0;
        for row in self
            .table(table)?
            .iter_mut()
            .filter(|row| keys_match(row, record, key_columns))
        {
            for (column, value) in record {
                row.insert(column.clone(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_all(&mut self, table: &str) -> Result<u64> {
        let rows = self.table(table)?;
        let removed = rows.len() as u64;
        rows.clear();
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction { store, staged } = *self;
        let mut tables = store.tables.write();
        for (table, rows) in staged {
            tables.insert(table, rows);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_ident("name").unwrap(), "\"name\"");
        assert_eq!(quote_ident("we\"ird").unwrap(), "\"we\"\"ird\"");
        assert_eq!(quote_table("public.orders").unwrap(), "\"public\".\"orders\"");
        assert!(quote_ident("").is_err());
        assert_eq!(
            key_predicate(&["id".to_string(), "region".to_string()]).unwrap(),
            "t.\"id\" = r.\"id\" AND t.\"region\" = r.\"region\""
        );
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_rows() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert("users", &record(json!({"id": 1}))).await.unwrap();
        assert!(store.rows("users").is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = InMemoryStore::new();
        store.seed("users", vec![record(json!({"id": 1, "name": "a"}))]);

        let mut tx = store.begin().await.unwrap();
        tx.delete_all("users").await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_update() {
        let store = InMemoryStore::new();
        store.seed("users", vec![record(json!({"id": 1, "name": "a"}))]);
        let keys = vec!["id".to_string()];

        let mut tx = store.begin().await.unwrap();
        let update = record(json!({"id": 1, "name": "b"}));
        assert!(tx.exists("users", &keys, &update).await.unwrap());
        assert_eq!(tx.update("users", &keys, &update).await.unwrap(), 1);
        assert!(!tx
            .exists("users", &keys, &record(json!({"id": 2})))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.rows("users")[0]["name"], json!("b"));
    }

    #[tokio::test]
    async fn test_fetch_paginates() {
        let store = InMemoryStore::new();
        store.seed(
            "events",
            (0..5).map(|i| record(json!({"n": i}))).collect(),
        );
        let page = store.fetch("events", Some(2), Some(3)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["n"], json!(3));
        assert!(store.fetch("missing", None, None).await.is_err());
    }
}
