//! Spatio-temporal item catalog.
//!
//! Items are STAC item documents keyed by `(collection, id)`. Loads read a
//! newline-delimited JSON file and insert every line in one transaction with
//! insert-ignore semantics: an item whose key already exists is left as is.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Catalog failures, classified by whether retrying can help.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CatalogStoreError {
    #[error("Catalog connection error: {0}")]
    Connection(String),

    #[error("Catalog rejected item schema: {0}")]
    Schema(String),

    #[error("Catalog constraint violated: {0}")]
    Constraint(String),

    #[error("Failed to read staged items: {0}")]
    Io(String),
}

impl CatalogStoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogStoreError::Connection(_) | CatalogStoreError::Io(_))
    }
}

/// Per-item result of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Register a collection so items can reference it.
    async fn ensure_collection(&self, collection: &str) -> Result<(), CatalogStoreError>;

    /// Load every item in an NDJSON file, one outcome per line in file order.
    async fn load_ndjson(&self, path: &Path) -> Result<Vec<InsertOutcome>, CatalogStoreError>;

    async fn get_item(&self, collection: &str, id: &str) -> Result<Option<Value>, CatalogStoreError>;

    async fn count_items(&self, collection: &str) -> Result<u64, CatalogStoreError>;
}

/// Key and time columns extracted from an item document.
#[derive(Debug, Clone)]
struct ItemKey {
    collection: String,
    id: String,
    datetime: Option<DateTime<Utc>>,
    start_datetime: Option<DateTime<Utc>>,
    end_datetime: Option<DateTime<Utc>>,
}

impl ItemKey {
    fn from_item(item: &Value) -> Result<Self, CatalogStoreError> {
        let text = |field: &str| {
            item.get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| CatalogStoreError::Schema(format!("item is missing '{}'", field)))
        };
        let time = |field: &str| -> Result<Option<DateTime<Utc>>, CatalogStoreError> {
            match item.pointer(&format!("/properties/{}", field)) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| Some(dt.with_timezone(&Utc)))
                    .map_err(|e| CatalogStoreError::Schema(format!("invalid {}: {}", field, e))),
                Some(other) => Err(CatalogStoreError::Schema(format!(
                    "invalid {}: {}",
                    field, other
                ))),
            }
        };

        let key = ItemKey {
            collection: text("collection")?,
            id: text("id")?,
            datetime: time("datetime")?,
            start_datetime: time("start_datetime")?,
            end_datetime: time("end_datetime")?,
        };

        if key.datetime.is_none() && (key.start_datetime.is_none() || key.end_datetime.is_none()) {
            return Err(CatalogStoreError::Schema(format!(
                "item {} needs datetime or start_datetime/end_datetime",
                key.id
            )));
        }
        Ok(key)
    }
}

async fn read_items(path: &Path) -> Result<Vec<(ItemKey, Value)>, CatalogStoreError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CatalogStoreError::Io(format!("{}: {}", path.display(), e)))?;

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let item: Value = serde_json::from_str(line)
                .map_err(|e| CatalogStoreError::Schema(format!("invalid item JSON: {}", e)))?;
            Ok((ItemKey::from_item(&item)?, item))
        })
        .collect()
}

/// PostgreSQL-backed catalog.
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    /// Create a new catalog connection from database URL.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, CatalogStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| CatalogStoreError::Connection(format!("Connection failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), CatalogStoreError> {
        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .map_err(classify_sqlx_error)?;
            }
        }

        info!("Catalog schema migrated");
        Ok(())
    }
}

fn classify_sqlx_error(err: sqlx::Error) -> CatalogStoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            if code.starts_with("23") {
                CatalogStoreError::Constraint(err.to_string())
            } else if code.starts_with("42") || code.starts_with("22") {
                CatalogStoreError::Schema(err.to_string())
            } else {
                CatalogStoreError::Connection(err.to_string())
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_) => CatalogStoreError::Schema(err.to_string()),
        _ => CatalogStoreError::Connection(err.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    content: sqlx::types::Json<Value>,
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn ensure_collection(&self, collection: &str) -> Result<(), CatalogStoreError> {
        sqlx::query("INSERT INTO collections (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn load_ndjson(&self, path: &Path) -> Result<Vec<InsertOutcome>, CatalogStoreError> {
        let items = read_items(path).await?;
        let mut tx = self.pool.begin().await.map_err(classify_sqlx_error)?;
        let mut outcomes = Vec::with_capacity(items.len());

        for (key, item) in &items {
            let result = sqlx::query(
                r#"
                INSERT INTO items (
                    collection, id, datetime, start_datetime, end_datetime, content
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (collection, id) DO NOTHING
                "#,
            )
            .bind(&key.collection)
            .bind(&key.id)
            .bind(key.datetime)
            .bind(key.start_datetime)
            .bind(key.end_datetime)
            .bind(sqlx::types::Json(item))
            .execute(&mut *tx)
            .await
            .map_err(classify_sqlx_error)?;

            outcomes.push(if result.rows_affected() == 0 {
                InsertOutcome::AlreadyPresent
            } else {
                InsertOutcome::Inserted
            });
        }

        tx.commit().await.map_err(classify_sqlx_error)?;
        debug!(count = outcomes.len(), "Loaded items");
        Ok(outcomes)
    }

    async fn get_item(&self, collection: &str, id: &str) -> Result<Option<Value>, CatalogStoreError> {
        let row: Option<ItemRow> =
            sqlx::query_as("SELECT content FROM items WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(classify_sqlx_error)?;

        Ok(row.map(|r| r.content.0))
    }

    async fn count_items(&self, collection: &str) -> Result<u64, CatalogStoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE collection = $1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Default)]
struct MemoryState {
    collections: BTreeSet<String>,
    items: BTreeMap<(String, String), Value>,
    unavailable: bool,
}

/// Catalog held in memory with the same key and transaction semantics as Postgres.
#[derive(Default)]
pub struct MemoryCatalogStore {
    state: Mutex<MemoryState>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with a connection error while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn ensure_collection(&self, collection: &str) -> Result<(), CatalogStoreError> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(CatalogStoreError::Connection("catalog unavailable".into()));
        }
        state.collections.insert(collection.to_string());
        Ok(())
    }

    async fn load_ndjson(&self, path: &Path) -> Result<Vec<InsertOutcome>, CatalogStoreError> {
        let items = read_items(path).await?;
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(CatalogStoreError::Connection("catalog unavailable".into()));
        }

        // Validate the whole file before touching state so a failed load inserts nothing.
        if let Some((key, _)) = items
            .iter()
            .find(|(key, _)| !state.collections.contains(&key.collection))
        {
            return Err(CatalogStoreError::Constraint(format!(
                "collection '{}' does not exist",
                key.collection
            )));
        }

        let mut outcomes = Vec::with_capacity(items.len());
        for (key, item) in items {
            let map_key = (key.collection, key.id);
            if state.items.contains_key(&map_key) {
                outcomes.push(InsertOutcome::AlreadyPresent);
            } else {
                state.items.insert(map_key, item);
                outcomes.push(InsertOutcome::Inserted);
            }
        }
        Ok(outcomes)
    }

    async fn get_item(&self, collection: &str, id: &str) -> Result<Option<Value>, CatalogStoreError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(CatalogStoreError::Connection("catalog unavailable".into()));
        }
        Ok(state
            .items
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn count_items(&self, collection: &str) -> Result<u64, CatalogStoreError> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(CatalogStoreError::Connection("catalog unavailable".into()));
        }
        Ok(state.items.keys().filter(|(c, _)| c == collection).count() as u64)
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS items (
    collection TEXT NOT NULL REFERENCES collections(id),
    id TEXT NOT NULL,
    datetime TIMESTAMPTZ,
    start_datetime TIMESTAMPTZ,
    end_datetime TIMESTAMPTZ,
    content JSONB NOT NULL,
    loaded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),

    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_items_datetime ON items(collection, datetime);
CREATE INDEX IF NOT EXISTS idx_items_range ON items(collection, start_datetime, end_datetime)
"#;
