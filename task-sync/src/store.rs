//! Local store interface consumed by the sync engine
//!
//! The engine never talks SQL. It filters rows with a [`Predicate`], applies
//! atomic batches of [`StoreOperation`]s and reads typed records back through
//! [`FromRow`]. `SqliteTaskStore` in `local_store` is the bundled
//! implementation.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// Integer primary key assigned by the local store
pub type LocalId = i64;

/// Persisted entity kinds the engine reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Task,
    List,
    Tag,
    TagLink,
    Subtask,
    Recurring,
    RecurringChild,
}

impl EntityKind {
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::List => "lists",
            EntityKind::Tag => "tags",
            EntityKind::TagLink => "task_tag",
            EntityKind::Subtask => "subtasks",
            EntityKind::Recurring => "recurring",
            EntityKind::RecurringChild => "recurring_tw_mask",
        }
    }
}

/// Local dirty marker of a task, as stored in `tasks.sync_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    Nothing,
    Add,
    NeedSync,
    Delete,
}

impl DirtyState {
    pub fn as_i64(self) -> i64 {
        match self {
            DirtyState::Nothing => 0,
            DirtyState::Add => 1,
            DirtyState::NeedSync => 2,
            DirtyState::Delete => -1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => DirtyState::Add,
            2 => DirtyState::NeedSync,
            -1 => DirtyState::Delete,
            _ => DirtyState::Nothing,
        }
    }

    /// Whether the task has local changes the server has not seen.
    pub fn is_dirty(self) -> bool {
        self != DirtyState::Nothing
    }
}

/// One row: column name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) {
        self.0.insert(column.to_string(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Columns whose value in `self` differs from `current`.
    pub fn diff(&self, current: &Row) -> Row {
        Row(self
            .0
            .iter()
            .filter(|(k, v)| current.get(k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    pub fn i64(&self, column: &str) -> SyncResult<i64> {
        self.opt_i64(column)?
            .ok_or_else(|| missing(column))
    }

    pub fn opt_i64(&self, column: &str) -> SyncResult<Option<i64>> {
        match self.0.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(i64::from(*b))),
            Some(value) => value
                .as_i64()
                .map(Some)
                .ok_or_else(|| invalid(column, value)),
        }
    }

    pub fn string(&self, column: &str) -> SyncResult<String> {
        self.opt_string(column)?
            .ok_or_else(|| missing(column))
    }

    pub fn opt_string(&self, column: &str) -> SyncResult<Option<String>> {
        match self.0.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(value) => Err(invalid(column, value)),
        }
    }

    pub fn bool(&self, column: &str) -> SyncResult<bool> {
        Ok(self.opt_i64(column)?.unwrap_or(0) != 0)
    }
}

fn missing(column: &str) -> SyncError {
    SyncError::Internal(format!("Missing column: {}", column))
}

fn invalid(column: &str, value: &Value) -> SyncError {
    SyncError::Internal(format!("Invalid value for column {}: {}", column, value))
}

/// Row filter understood by every store
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq(column.to_string(), value.into())
    }

    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All => other,
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Evaluate against an in-memory row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq(column, value) => row.get(column) == Some(value),
            Predicate::In(column, values) => row
                .get(column)
                .is_some_and(|current| values.contains(current)),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
        }
    }
}

/// One mutation inside an atomic batch
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOperation {
    Insert {
        kind: EntityKind,
        values: Row,
    },
    Update {
        kind: EntityKind,
        selection: Predicate,
        values: Row,
    },
    Delete {
        kind: EntityKind,
        selection: Predicate,
    },
}

impl StoreOperation {
    pub fn kind(&self) -> EntityKind {
        match self {
            StoreOperation::Insert { kind, .. }
            | StoreOperation::Update { kind, .. }
            | StoreOperation::Delete { kind, .. } => *kind,
        }
    }
}

/// Typed record decoded from a [`Row`]
pub trait FromRow: Sized {
    /// # Errors
    ///
    /// Returns an error when a required column is missing or has the wrong type.
    fn from_row(row: &Row) -> SyncResult<Self>;
}

/// Record carrying the id assigned by the local store
pub trait HasLocalId {
    fn local_id(&self) -> LocalId;
}

/// Persistence layer the engine reconciles into.
///
/// `apply_batch` must be all-or-nothing: on error no operation of the
/// batch is visible.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn query(&self, kind: EntityKind, predicate: &Predicate) -> SyncResult<Vec<Row>>;

    /// Apply operations atomically. Returns, per operation, the id assigned
    /// by inserts (`None` for updates and deletes).
    async fn apply_batch(&self, operations: Vec<StoreOperation>) -> SyncResult<Vec<Option<LocalId>>>;

    async fn delete(&self, kind: EntityKind, ids: &[LocalId]) -> SyncResult<u64>;

    async fn load_sync_key(&self, account: LocalId) -> SyncResult<Option<String>>;

    async fn store_sync_key(&self, account: LocalId, key: Option<&str>) -> SyncResult<()>;

    /// Snapshot the whole store, returning where the backup was written.
    async fn backup(&self) -> SyncResult<String>;
}

/// Query and decode rows into typed records.
///
/// # Errors
///
/// Propagates store errors and row decoding failures.
pub async fn fetch<T, S>(store: &S, kind: EntityKind, predicate: &Predicate) -> SyncResult<Vec<T>>
where
    T: FromRow,
    S: TaskStore + ?Sized,
{
    store
        .query(kind, predicate)
        .await?
        .iter()
        .map(T::from_row)
        .collect()
}

/// Query rows whose `column` holds one of `ids`, at most `chunk` ids per
/// query.
///
/// # Errors
///
/// Propagates store errors.
pub async fn query_in<S>(
    store: &S,
    kind: EntityKind,
    column: &str,
    ids: &[LocalId],
    chunk: usize,
) -> SyncResult<Vec<Row>>
where
    S: TaskStore + ?Sized,
{
    let mut rows = Vec::new();
    for part in ids.chunks(chunk.max(1)) {
        let predicate = Predicate::is_in(column, part.iter().copied());
        rows.extend(store.query(kind, &predicate).await?);
    }
    Ok(rows)
}

/// Local task row
#[derive(Debug, Clone, PartialEq)]
pub struct LocalTask {
    pub id: LocalId,
    pub uuid: String,
    pub list_id: LocalId,
    pub name: String,
    pub content: String,
    pub done: bool,
    pub priority: i64,
    pub due: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub additional_entries: Option<String>,
    pub recurring: Option<LocalId>,
    pub sync_state: DirtyState,
}

impl FromRow for LocalTask {
    fn from_row(row: &Row) -> SyncResult<Self> {
        Ok(Self {
            id: row.i64("id")?,
            uuid: row.string("uuid")?,
            list_id: row.i64("list_id")?,
            name: row.string("name")?,
            content: row.opt_string("content")?.unwrap_or_default(),
            done: row.bool("done")?,
            priority: row.opt_i64("priority")?.unwrap_or(0),
            due: row.opt_i64("due")?,
            created_at: row.opt_i64("created_at")?.unwrap_or(0),
            updated_at: row.opt_i64("updated_at")?.unwrap_or(0),
            additional_entries: row.opt_string("additional_entries")?,
            recurring: row.opt_i64("recurring")?,
            sync_state: DirtyState::from_i64(row.opt_i64("sync_state")?.unwrap_or(0)),
        })
    }
}

impl HasLocalId for LocalTask {
    fn local_id(&self) -> LocalId {
        self.id
    }
}

/// Task list; a Taskwarrior project
#[derive(Debug, Clone, PartialEq)]
pub struct ListRecord {
    pub id: LocalId,
    pub account_id: LocalId,
    pub name: String,
}

impl FromRow for ListRecord {
    fn from_row(row: &Row) -> SyncResult<Self> {
        Ok(Self {
            id: row.i64("id")?,
            account_id: row.i64("account_id")?,
            name: row.string("name")?,
        })
    }
}

impl HasLocalId for ListRecord {
    fn local_id(&self) -> LocalId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub id: LocalId,
    pub name: String,
}

impl FromRow for TagRecord {
    fn from_row(row: &Row) -> SyncResult<Self> {
        Ok(Self {
            id: row.i64("id")?,
            name: row.string("name")?,
        })
    }
}

impl HasLocalId for TagRecord {
    fn local_id(&self) -> LocalId {
        self.id
    }
}

/// Link between a task and a tag
#[derive(Debug, Clone, PartialEq)]
pub struct TagLink {
    pub id: LocalId,
    pub task_id: LocalId,
    pub tag_id: LocalId,
}

impl FromRow for TagLink {
    fn from_row(row: &Row) -> SyncResult<Self> {
        Ok(Self {
            id: row.i64("id")?,
            task_id: row.i64("task_id")?,
            tag_id: row.i64("tag_id")?,
        })
    }
}

impl HasLocalId for TagLink {
    fn local_id(&self) -> LocalId {
        self.id
    }
}

/// Parent task depends on child task
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskLink {
    pub id: LocalId,
    pub parent_id: LocalId,
    pub child_id: LocalId,
}

impl FromRow for SubtaskLink {
    fn from_row(row: &Row) -> SyncResult<Self> {
        Ok(Self {
            id: row.i64("id")?,
            parent_id: row.i64("parent_id")?,
            child_id: row.i64("child_id")?,
        })
    }
}

impl HasLocalId for SubtaskLink {
    fn local_id(&self) -> LocalId {
        self.id
    }
}
