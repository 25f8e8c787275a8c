//! Shared fixtures for the integration tests: a SQLite store that records
//! every write and a connector that replays scripted server responses.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use task_sync::{
    Connection, Connector, EntityKind, LocalId, LocalStoreConfig, Predicate, Row, SqliteTaskStore,
    StoreOperation, SyncConfig, SyncError, SyncMessage, SyncResult, TaskStore, TaskwarriorAccount,
};
use tempfile::{NamedTempFile, TempDir};

pub const ACCOUNT: LocalId = 1;

/// Route engine logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn account() -> TaskwarriorAccount {
    TaskwarriorAccount {
        account_id: ACCOUNT,
        host: "tasks.example.org".into(),
        port: 53589,
        org: "Public".into(),
        user: "alice".into(),
        user_key: "9c4f4a5e-credential".into(),
        root_cert: String::new(),
        client_cert: String::new(),
        client_key: String::new(),
    }
}

/// SQLite store that logs batches and can poison task batches
pub struct RecordingStore {
    inner: SqliteTaskStore,
    batches: Mutex<Vec<Vec<StoreOperation>>>,
    deletes: Mutex<Vec<(EntityKind, Vec<LocalId>)>>,
    backups: AtomicUsize,
    poison_task_batches: AtomicBool,
    fail_key_reads: AtomicBool,
    _file: NamedTempFile,
    _backup_dir: TempDir,
}

impl RecordingStore {
    pub async fn new() -> Self {
        let file = NamedTempFile::new().expect("Failed to create temp db");
        let backup_dir = TempDir::new().expect("Failed to create backup dir");
        let config = LocalStoreConfig {
            db_path: file.path().to_str().unwrap().to_string(),
            max_connections: 1,
            enable_wal: true,
            backup_dir: backup_dir.path().to_path_buf(),
        };
        let inner = SqliteTaskStore::new(config).await.expect("Failed to open store");
        Self {
            inner,
            batches: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            backups: AtomicUsize::new(0),
            poison_task_batches: AtomicBool::new(false),
            fail_key_reads: AtomicBool::new(false),
            _file: file,
            _backup_dir: backup_dir,
        }
    }

    /// Make every batch inserting tasks violate a unique index.
    pub fn poison_task_batches(&self) {
        self.poison_task_batches.store(true, Ordering::SeqCst);
    }

    /// Make every sync key lookup fail.
    pub fn fail_key_reads(&self) {
        self.fail_key_reads.store(true, Ordering::SeqCst);
    }

    /// Mark a task as changed locally.
    pub async fn touch_task(&self, uuid: &str, name: &str) {
        self.inner
            .apply_batch(vec![StoreOperation::Update {
                kind: EntityKind::Task,
                selection: Predicate::eq("uuid", uuid),
                values: Row::new()
                    .with("name", name)
                    .with("sync_state", task_sync::DirtyState::NeedSync.as_i64()),
            }])
            .await
            .unwrap();
    }

    /// Number of write calls (batches and deletes) seen so far
    pub fn write_count(&self) -> usize {
        self.batches.lock().unwrap().len() + self.deletes.lock().unwrap().len()
    }

    pub fn batches(&self) -> Vec<Vec<StoreOperation>> {
        self.batches.lock().unwrap().clone()
    }

    /// Operation counts of batches that insert or update tasks
    pub fn task_batch_sizes(&self) -> Vec<usize> {
        self.batches()
            .iter()
            .filter(|ops| {
                ops.iter().any(|op| {
                    op.kind() == EntityKind::Task && !matches!(op, StoreOperation::Delete { .. })
                })
            })
            .map(Vec::len)
            .collect()
    }

    pub fn backups(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    pub async fn rows(&self, kind: EntityKind, predicate: Predicate) -> Vec<Row> {
        self.inner.query(kind, &predicate).await.unwrap()
    }

    /// Create a list directly, bypassing the recorder.
    pub async fn seed_list(&self, name: &str) -> LocalId {
        self.inner
            .apply_batch(vec![StoreOperation::Insert {
                kind: EntityKind::List,
                values: Row::new().with("account_id", ACCOUNT).with("name", name),
            }])
            .await
            .unwrap()[0]
            .unwrap()
    }

    /// Create a task directly, bypassing the recorder.
    pub async fn seed_task(&self, list_id: LocalId, uuid: &str, name: &str, sync_state: i64) -> LocalId {
        self.inner
            .apply_batch(vec![StoreOperation::Insert {
                kind: EntityKind::Task,
                values: Row::new()
                    .with("uuid", uuid)
                    .with("list_id", list_id)
                    .with("name", name)
                    .with("created_at", 1_700_000_000)
                    .with("updated_at", 1_700_000_000)
                    .with("sync_state", sync_state),
            }])
            .await
            .unwrap()[0]
            .unwrap()
    }
}

#[async_trait]
impl TaskStore for RecordingStore {
    async fn query(&self, kind: EntityKind, predicate: &Predicate) -> SyncResult<Vec<Row>> {
        self.inner.query(kind, predicate).await
    }

    async fn apply_batch(&self, mut operations: Vec<StoreOperation>) -> SyncResult<Vec<Option<LocalId>>> {
        self.batches.lock().unwrap().push(operations.clone());

        let inserts_tasks = operations
            .iter()
            .any(|op| matches!(op, StoreOperation::Insert { kind: EntityKind::Task, .. }));
        if inserts_tasks && self.poison_task_batches.load(Ordering::SeqCst) {
            for _ in 0..2 {
                operations.push(StoreOperation::Insert {
                    kind: EntityKind::Tag,
                    values: Row::new().with("name", "poison"),
                });
            }
        }
        self.inner.apply_batch(operations).await
    }

    async fn delete(&self, kind: EntityKind, ids: &[LocalId]) -> SyncResult<u64> {
        self.deletes.lock().unwrap().push((kind, ids.to_vec()));
        self.inner.delete(kind, ids).await
    }

    async fn load_sync_key(&self, account: LocalId) -> SyncResult<Option<String>> {
        if self.fail_key_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Internal("sync key unavailable".into()));
        }
        self.inner.load_sync_key(account).await
    }

    async fn store_sync_key(&self, account: LocalId, key: Option<&str>) -> SyncResult<()> {
        self.inner.store_sync_key(account, key).await
    }

    async fn backup(&self) -> SyncResult<String> {
        self.backups.fetch_add(1, Ordering::SeqCst);
        self.inner.backup().await
    }
}

/// Response builder
pub fn response(code: u16, status: &str, payload: &str) -> SyncMessage {
    let mut message = SyncMessage::new();
    message.set_header("code", code.to_string());
    message.set_header("status", status);
    message.set_payload(payload);
    message
}

/// Payload with task lines followed by a sync key line
pub fn payload(tasks: &[String], sync_key: &str) -> String {
    let mut out = String::new();
    for task in tasks {
        out.push_str(task);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(sync_key);
    out.push('\n');
    out
}

/// Replays queued responses, one per connection, and records requests
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    responses: Arc<Mutex<VecDeque<SyncMessage>>>,
    requests: Arc<Mutex<Vec<SyncMessage>>>,
    connects: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(responses: impl IntoIterator<Item = SyncMessage>) -> Self {
        let connector = Self::default();
        connector.responses.lock().unwrap().extend(responses);
        connector
    }

    pub fn push(&self, response: SyncMessage) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<SyncMessage> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedConnection {
    response: Option<SyncMessage>,
    requests: Arc<Mutex<Vec<SyncMessage>>>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&mut self, message: &SyncMessage) -> SyncResult<()> {
        self.requests.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn receive(&mut self) -> SyncResult<SyncMessage> {
        self.response
            .take()
            .ok_or_else(|| SyncError::Protocol("no scripted response left".into()))
    }

    async fn close(&mut self) -> SyncResult<()> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Conn = ScriptedConnection;

    async fn connect(&self, _account: &TaskwarriorAccount, _config: &SyncConfig) -> SyncResult<Self::Conn> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedConnection {
            response: self.responses.lock().unwrap().pop_front(),
            requests: self.requests.clone(),
            closes: self.closes.clone(),
            closed: false,
        })
    }
}

/// One Taskwarrior JSON task line; `fields` is spliced into the object.
pub fn task_json(uuid: &str, status: &str, fields: &str) -> String {
    let mut json = format!(
        r#"{{"uuid":"{}","status":"{}","description":"Task {}","entry":"20240301T090000Z","modified":"20240302T090000Z""#,
        uuid, status, uuid
    );
    if !fields.is_empty() {
        json.push(',');
        json.push_str(fields);
    }
    json.push('}');
    json
}
