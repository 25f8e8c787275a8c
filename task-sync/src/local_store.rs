//! SQLite-backed local task store
//!
//! Provides:
//! - Lists, tags, tasks and their link tables
//! - Atomic batch apply inside one transaction
//! - Per-account sync key storage
//! - Online backup via `VACUUM INTO`

use crate::error::{SyncError, SyncResult};
use crate::store::{EntityKind, LocalId, Predicate, Row, StoreOperation, TaskStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};
use std::path::PathBuf;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Configuration for the local store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Directory receiving backups
    pub backup_dir: PathBuf,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "tasks.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            backup_dir: PathBuf::from("backups"),
        }
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT 0,
        UNIQUE(account_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS recurring (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        label TEXT NOT NULL,
        minutes INTEGER NOT NULL DEFAULT 0,
        hours INTEGER NOT NULL DEFAULT 0,
        days INTEGER NOT NULL DEFAULT 0,
        months INTEGER NOT NULL DEFAULT 0,
        years INTEGER NOT NULL DEFAULT 0,
        weekdays INTEGER NOT NULL DEFAULT 0,
        for_due INTEGER NOT NULL DEFAULT 1,
        start_date INTEGER,
        end_date INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        list_id INTEGER NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        content TEXT NOT NULL DEFAULT '',
        done INTEGER NOT NULL DEFAULT 0,
        priority INTEGER NOT NULL DEFAULT 0,
        due INTEGER,
        created_at INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL DEFAULT 0,
        additional_entries TEXT,
        recurring INTEGER REFERENCES recurring(id) ON DELETE SET NULL,
        sync_state INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_tag (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
        UNIQUE(task_id, tag_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subtasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        child_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        UNIQUE(parent_id, child_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS recurring_tw_mask (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
        child_id INTEGER NOT NULL UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
        offset_count INTEGER NOT NULL,
        due_override INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_list ON tasks(list_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_sync_state ON tasks(sync_state)",
    "CREATE INDEX IF NOT EXISTS idx_task_tag_task ON task_tag(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_subtasks_parent ON subtasks(parent_id)",
];

/// Local database handle
pub struct SqliteTaskStore {
    pool: SqlitePool,
    backup_dir: PathBuf,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the local store and initialize its schema.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Database` if the file cannot be opened or migrated.
    pub async fn new(config: LocalStoreConfig) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal_mode);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            backup_dir: config.backup_dir,
        };
        store.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local task store");
        Ok(store)
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connection
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn query(&self, kind: EntityKind, predicate: &Predicate) -> SyncResult<Vec<Row>> {
        let mut params = Vec::new();
        let clause = where_clause(predicate, &mut params)?;
        let sql = format!("SELECT * FROM {} WHERE {} ORDER BY id", kind.table(), clause);

        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn apply_batch(&self, operations: Vec<StoreOperation>) -> SyncResult<Vec<Option<LocalId>>> {
        let mut tx = self.pool.begin().await?;
        let mut assigned = Vec::with_capacity(operations.len());

        for operation in &operations {
            let mut params = Vec::new();
            let sql = match operation {
                StoreOperation::Insert { kind, values } => insert_sql(*kind, values, &mut params)?,
                StoreOperation::Update {
                    kind,
                    selection,
                    values,
                } => {
                    if values.is_empty() {
                        assigned.push(None);
                        continue;
                    }
                    update_sql(*kind, selection, values, &mut params)?
                }
                StoreOperation::Delete { kind, selection } => {
                    let clause = where_clause(selection, &mut params)?;
                    format!("DELETE FROM {} WHERE {}", kind.table(), clause)
                }
            };

            let mut query = sqlx::query(&sql);
            for value in &params {
                query = bind_value(query, value);
            }
            let result = query.execute(&mut *tx).await?;

            assigned.push(match operation {
                StoreOperation::Insert { .. } => Some(result.last_insert_rowid()),
                _ => None,
            });
        }

        tx.commit().await?;

        tracing::debug!(operations = operations.len(), "Applied batch");
        Ok(assigned)
    }

    async fn delete(&self, kind: EntityKind, ids: &[LocalId]) -> SyncResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut params = Vec::new();
        let clause = where_clause(&Predicate::is_in("id", ids.iter().copied()), &mut params)?;
        let sql = format!("DELETE FROM {} WHERE {}", kind.table(), clause);

        let mut query = sqlx::query(&sql);
        for value in &params {
            query = bind_value(query, value);
        }
        let result = query.execute(&self.pool).await?;

        tracing::debug!(table = kind.table(), deleted = result.rows_affected(), "Deleted rows");
        Ok(result.rows_affected())
    }

    async fn load_sync_key(&self, account: LocalId) -> SyncResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(sync_key_slot(account))
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    async fn store_sync_key(&self, account: LocalId, key: Option<&str>) -> SyncResult<()> {
        match key {
            Some(key) => {
                sqlx::query(
                    r#"
                    INSERT INTO sync_metadata (key, value, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                                   updated_at = excluded.updated_at
                    "#,
                )
                .bind(sync_key_slot(account))
                .bind(key)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM sync_metadata WHERE key = ?")
                    .bind(sync_key_slot(account))
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn backup(&self) -> SyncResult<String> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let target = self.backup_dir.join(format!(
            "tasks-{}.db",
            Utc::now().format("%Y%m%d-%H%M%S%.3f")
        ));
        let target = target.to_string_lossy().into_owned();

        sqlx::query("VACUUM INTO ?")
            .bind(&target)
            .execute(&self.pool)
            .await?;

        tracing::info!(backup = %target, "Backed up local task store");
        Ok(target)
    }
}

fn sync_key_slot(account: LocalId) -> String {
    format!("sync_key:{}", account)
}

fn ident(column: &str) -> SyncResult<&str> {
    if !column.is_empty() && column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(column)
    } else {
        Err(SyncError::Internal(format!("Invalid column name: {}", column)))
    }
}

fn where_clause(predicate: &Predicate, params: &mut Vec<Value>) -> SyncResult<String> {
    Ok(match predicate {
        Predicate::All => "1".to_string(),
        Predicate::Eq(column, Value::Null) => format!("{} IS NULL", ident(column)?),
        Predicate::Eq(column, value) => {
            params.push(value.clone());
            format!("{} = ?", ident(column)?)
        }
        Predicate::In(_, values) if values.is_empty() => "0".to_string(),
        Predicate::In(column, values) => {
            params.extend(values.iter().cloned());
            format!(
                "{} IN ({})",
                ident(column)?,
                vec!["?"; values.len()].join(", ")
            )
        }
        Predicate::And(parts) if parts.is_empty() => "1".to_string(),
        Predicate::And(parts) => parts
            .iter()
            .map(|part| where_clause(part, params).map(|clause| format!("({})", clause)))
            .collect::<SyncResult<Vec<_>>>()?
            .join(" AND "),
    })
}

fn insert_sql(kind: EntityKind, values: &Row, params: &mut Vec<Value>) -> SyncResult<String> {
    if values.is_empty() {
        return Ok(format!("INSERT INTO {} DEFAULT VALUES", kind.table()));
    }
    let mut columns = Vec::with_capacity(values.len());
    for (column, value) in values.columns() {
        columns.push(ident(column)?);
        params.push(value.clone());
    }
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        kind.table(),
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    ))
}

fn update_sql(
    kind: EntityKind,
    selection: &Predicate,
    values: &Row,
    params: &mut Vec<Value>,
) -> SyncResult<String> {
    let mut assignments = Vec::with_capacity(values.len());
    for (column, value) in values.columns() {
        assignments.push(format!("{} = ?", ident(column)?));
        params.push(value.clone());
    }
    let clause = where_clause(selection, params)?;
    Ok(format!(
        "UPDATE {} SET {} WHERE {}",
        kind.table(),
        assignments.join(", "),
        clause
    ))
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<i64>),
        Value::Bool(b) => query.bind(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn decode_row(row: &SqliteRow) -> SyncResult<Row> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => Value::from(row.try_get::<f64, _>(idx)?),
                _ => Value::from(row.try_get::<String, _>(idx)?),
            }
        };
        out.set(column.name(), value);
    }
    Ok(out)
}
