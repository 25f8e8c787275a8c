//! Sync orchestration
//!
//! Drives one request/response exchange with the server per attempt and
//! owns the recovery paths:
//!
//! - *ancestor mismatch*: back up the store, forget the sync key and run a
//!   fresh exchange without local changes, then report the mismatch
//! - *sync key not found*: forget the sync key and retry, bounded by
//!   `SyncConfig::max_key_resyncs` per invocation

use crate::config::{SyncConfig, TaskwarriorAccount};
use crate::error::{ServerCode, SyncError, SyncResult};
use crate::message::SyncMessage;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::store::{
    fetch, query_in, DirtyState, EntityKind, FromRow, ListRecord, LocalId, LocalTask, Predicate, Row,
    StoreOperation, SubtaskLink, TagLink, TagRecord, TaskStore,
};
use crate::transport::{Connection, Connector};
use crate::translator::RemoteTask;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub const PROTOCOL_VERSION: &str = "v1";
const CLIENT_ID: &str = concat!("task-sync ", env!("CARGO_PKG_VERSION"));

/// Status text the server sends when it has no record of our sync key
pub const KEY_NOT_FOUND_STATUS: &str = "Client sync key not found.";
/// Fragment of the status text sent when histories diverged
pub const ANCESTOR_STATUS: &str = "Could not find common ancestor";

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Orchestrator states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Init,
    Connected,
    RequestSent,
    ResponseReceived,
    Reconciled,
    Committed,
    Failed,
}

impl SyncState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncState::Committed | SyncState::Failed)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Init => "INIT",
            SyncState::Connected => "CONNECTED",
            SyncState::RequestSent => "REQUEST_SENT",
            SyncState::ResponseReceived => "RESPONSE_RECEIVED",
            SyncState::Reconciled => "RECONCILED",
            SyncState::Committed => "COMMITTED",
            SyncState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// State of a single exchange, logged on every transition
struct Attempt {
    account: LocalId,
    recovery: bool,
    state: SyncState,
}

impl Attempt {
    fn new(account: LocalId, recovery: bool) -> Self {
        Self {
            account,
            recovery,
            state: SyncState::Init,
        }
    }

    fn advance(&mut self, next: SyncState) {
        tracing::debug!(
            account = self.account,
            recovery = self.recovery,
            from = %self.state,
            to = %next,
            "Sync state transition"
        );
        self.state = next;
    }

    fn fail(&mut self, err: SyncError) -> SyncError {
        self.advance(SyncState::Failed);
        tracing::warn!(account = self.account, error = %err, "Sync failed");
        err
    }

    /// Pass `result` through, moving to `FAILED` on error.
    fn check<T>(&mut self, result: SyncResult<T>) -> SyncResult<T> {
        result.map_err(|e| self.fail(e))
    }
}

/// Per-invocation state threaded through retries
#[derive(Debug, Default)]
pub struct SyncContext {
    /// Consecutive "sync key not found" responses seen so far
    pub key_resyncs: u32,
}

/// Outcome of a committed sync
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub account_id: LocalId,
    /// Local tasks sent to the server
    pub sent: usize,
    /// Remote tasks received
    pub received: usize,
    pub sync_key: Option<String>,
    pub key_resyncs: u32,
    pub reconcile: ReconcileReport,
}

/// Local task queued for upload
struct OutgoingTask {
    id: LocalId,
    deleted: bool,
    remote: RemoteTask,
}

/// Parsed sync response payload
#[derive(Debug, Default)]
pub struct ResponsePayload {
    pub sync_key: Option<String>,
    pub tasks: Vec<RemoteTask>,
}

impl ResponsePayload {
    /// Split a response payload into the sync key line and task lines.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Protocol` when a task line is not valid JSON.
    pub fn parse(message: &SyncMessage) -> SyncResult<Self> {
        let mut parsed = Self::default();
        for line in message.payload_lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('{') {
                parsed.tasks.push(RemoteTask::from_json_line(line)?);
            } else {
                parsed.sync_key = Some(line.to_string());
            }
        }
        Ok(parsed)
    }
}

/// Synchronizes Taskwarrior accounts with a local store
pub struct SyncEngine<S: TaskStore + ?Sized, C: Connector> {
    store: Arc<S>,
    connector: C,
    config: SyncConfig,
}

impl<S, C> SyncEngine<S, C>
where
    S: TaskStore + ?Sized,
    C: Connector,
{
    pub fn new(store: Arc<S>, connector: C, config: SyncConfig) -> Self {
        Self {
            store,
            connector,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run a full sync for `account`.
    ///
    /// Callers must not sync the same account concurrently.
    ///
    /// # Errors
    ///
    /// Returns the terminal failure of the run. `AncestorMismatch` is
    /// returned after the recovery exchange has completed.
    pub async fn sync(&self, account: &TaskwarriorAccount) -> SyncResult<SyncReport> {
        tracing::info!(account = account.account_id, server = %account.label(), "Starting sync");
        let mut context = SyncContext::default();
        let report = self.run(account, &mut context, false).await?;
        tracing::info!(
            account = account.account_id,
            sent = report.sent,
            received = report.received,
            "Sync committed"
        );
        Ok(report)
    }

    fn run<'a>(
        &'a self,
        account: &'a TaskwarriorAccount,
        context: &'a mut SyncContext,
        recovery: bool,
    ) -> BoxFuture<'a, SyncResult<SyncReport>> {
        Box::pin(async move {
            let mut attempt = Attempt::new(account.account_id, recovery);

            let prepared = async {
                let sync_key = self.store.load_sync_key(account.account_id).await?;
                let outgoing = if recovery {
                    Vec::new()
                } else {
                    self.collect_outgoing(account).await?
                };
                let request = build_request(account, sync_key.as_deref(), outgoing.iter().map(|t| &t.remote))?;
                Ok::<_, SyncError>((sync_key, outgoing, request))
            }
            .await;
            let (sync_key, outgoing, request) = attempt.check(prepared)?;

            let exchanged = self.exchange(account, &request, &mut attempt).await;
            let response = attempt.check(exchanged)?;

            let code = response
                .header("code")
                .and_then(|c| c.parse::<u16>().ok())
                .unwrap_or(400);
            let status = response.header("status").unwrap_or_default().to_string();

            if status == KEY_NOT_FOUND_STATUS {
                context.key_resyncs += 1;
                if context.key_resyncs > self.config.max_key_resyncs {
                    return Err(attempt.fail(SyncError::SyncKeyNotFound {
                        attempts: context.key_resyncs,
                    }));
                }
                tracing::info!(
                    account = account.account_id,
                    attempt = context.key_resyncs,
                    "Server lost our sync key, resetting it"
                );
                let reset = self.store.store_sync_key(account.account_id, None).await;
                attempt.check(reset)?;
                return self.run(account, context, recovery).await;
            }

            if !ServerCode::from_code(code).is_success() {
                if status.contains(ANCESTOR_STATUS) {
                    let mismatch = attempt.fail(SyncError::AncestorMismatch);
                    if !recovery {
                        self.recover_from_divergence(account, context).await;
                    }
                    return Err(mismatch);
                }
                return Err(attempt.fail(SyncError::ServerRejected { code, status }));
            }

            let payload = attempt.check(ResponsePayload::parse(&response))?;
            let received = payload.tasks.len();

            let reconciled = Reconciler::new(&*self.store, account.account_id, &self.config)
                .with_sent(outgoing.iter().map(|t| t.id))
                .reconcile(payload.tasks)
                .await;
            let reconciliation = attempt.check(reconciled)?;
            attempt.advance(SyncState::Reconciled);

            let committed = self.commit(account, payload.sync_key.as_deref(), &outgoing).await;
            attempt.check(committed)?;
            attempt.advance(SyncState::Committed);

            if let Some(message) = response.header("message").filter(|m| !m.is_empty()) {
                tracing::info!(account = account.account_id, message = %message, "Server message");
            }

            Ok(SyncReport {
                account_id: account.account_id,
                sent: outgoing.len(),
                received,
                sync_key: payload.sync_key.or(sync_key),
                key_resyncs: context.key_resyncs,
                reconcile: reconciliation.report,
            })
        })
    }

    /// Connect, send and receive. The connection is closed on every path.
    async fn exchange(
        &self,
        account: &TaskwarriorAccount,
        request: &SyncMessage,
        attempt: &mut Attempt,
    ) -> SyncResult<SyncMessage> {
        let mut connection = self.connector.connect(account, &self.config).await?;
        attempt.advance(SyncState::Connected);

        let result = async {
            connection.send(request).await?;
            attempt.advance(SyncState::RequestSent);
            let response = connection.receive().await?;
            attempt.advance(SyncState::ResponseReceived);
            Ok::<SyncMessage, SyncError>(response)
        }
        .await;

        if let Err(e) = connection.close().await {
            tracing::debug!(account = account.account_id, error = %e, "Closing connection failed");
        }
        result
    }

    /// Back up, forget the sync key and exchange again without local
    /// changes. Failures of the recovery run are logged; the caller still
    /// reports the mismatch.
    async fn recover_from_divergence(&self, account: &TaskwarriorAccount, context: &mut SyncContext) {
        tracing::warn!(account = account.account_id, "No common ancestor with server, resyncing from scratch");

        match self.store.backup().await {
            Ok(location) => tracing::info!(account = account.account_id, backup = %location, "Local store backed up"),
            Err(e) => {
                tracing::error!(account = account.account_id, error = %e, "Backup failed, skipping resync");
                return;
            }
        }
        if let Err(e) = self.store.store_sync_key(account.account_id, None).await {
            tracing::error!(account = account.account_id, error = %e, "Could not reset sync key");
            return;
        }
        if let Err(e) = self.run(account, context, true).await {
            tracing::error!(account = account.account_id, error = %e, "Recovery sync failed");
        }
    }

    /// Local tasks of the account that changed since the last sync.
    async fn collect_outgoing(&self, account: &TaskwarriorAccount) -> SyncResult<Vec<OutgoingTask>> {
        let store = &*self.store;
        let lists: Vec<ListRecord> = fetch(
            store,
            EntityKind::List,
            &Predicate::eq("account_id", account.account_id),
        )
        .await?;
        if lists.is_empty() {
            return Ok(Vec::new());
        }
        let list_names: HashMap<LocalId, String> = lists.into_iter().map(|l| (l.id, l.name)).collect();
        let list_ids: Vec<LocalId> = list_names.keys().copied().collect();

        let dirty = [DirtyState::Add, DirtyState::NeedSync, DirtyState::Delete].map(DirtyState::as_i64);
        let mut tasks: Vec<LocalTask> = Vec::new();
        for part in list_ids.chunks(self.config.batch_size.max(1)) {
            let predicate = Predicate::is_in("list_id", part.iter().copied())
                .and(Predicate::is_in("sync_state", dirty));
            tasks.extend(fetch::<LocalTask, _>(store, EntityKind::Task, &predicate).await?);
        }
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let task_ids: Vec<LocalId> = tasks.iter().map(|t| t.id).collect();

        let tags = self.tags_of(&task_ids).await?;
        let depends = self.depends_of(&task_ids).await?;

        let mut outgoing = Vec::with_capacity(tasks.len());
        for task in tasks {
            let project = list_names
                .get(&task.list_id)
                .map(String::as_str)
                .filter(|name| *name != self.config.inbox_name);
            let remote = RemoteTask::from_local(
                &task,
                project,
                tags.get(&task.id).map(Vec::as_slice).unwrap_or_default(),
                depends.get(&task.id).map(Vec::as_slice).unwrap_or_default(),
            )?;
            outgoing.push(OutgoingTask {
                id: task.id,
                deleted: task.sync_state == DirtyState::Delete,
                remote,
            });
        }
        tracing::debug!(account = account.account_id, count = outgoing.len(), "Collected local changes");
        Ok(outgoing)
    }

    async fn tags_of(&self, task_ids: &[LocalId]) -> SyncResult<HashMap<LocalId, Vec<String>>> {
        let links: Vec<TagLink> = self.typed_in(EntityKind::TagLink, "task_id", task_ids).await?;
        let tag_ids: Vec<LocalId> = links.iter().map(|l| l.tag_id).collect();
        let names: HashMap<LocalId, String> = self
            .typed_in::<TagRecord>(EntityKind::Tag, "id", &tag_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t.name))
            .collect();

        let mut out: HashMap<LocalId, Vec<String>> = HashMap::new();
        for link in links {
            if let Some(name) = names.get(&link.tag_id) {
                out.entry(link.task_id).or_default().push(name.clone());
            }
        }
        for names in out.values_mut() {
            names.sort();
        }
        Ok(out)
    }

    async fn depends_of(&self, task_ids: &[LocalId]) -> SyncResult<HashMap<LocalId, Vec<String>>> {
        let links: Vec<SubtaskLink> = self.typed_in(EntityKind::Subtask, "parent_id", task_ids).await?;
        let child_ids: Vec<LocalId> = links.iter().map(|l| l.child_id).collect();
        let uuids: HashMap<LocalId, String> = self
            .typed_in::<LocalTask>(EntityKind::Task, "id", &child_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t.uuid))
            .collect();

        let mut out: HashMap<LocalId, Vec<String>> = HashMap::new();
        for link in links {
            if let Some(uuid) = uuids.get(&link.child_id) {
                out.entry(link.parent_id).or_default().push(uuid.clone());
            }
        }
        for uuids in out.values_mut() {
            uuids.sort();
        }
        Ok(out)
    }

    async fn typed_in<T: FromRow>(&self, kind: EntityKind, column: &str, ids: &[LocalId]) -> SyncResult<Vec<T>> {
        query_in(&*self.store, kind, column, ids, self.config.batch_size)
            .await?
            .iter()
            .map(T::from_row)
            .collect()
    }

    /// Persist the new sync key, clear dirty markers of the tasks that were
    /// sent and purge the ones deleted locally.
    async fn commit(
        &self,
        account: &TaskwarriorAccount,
        sync_key: Option<&str>,
        outgoing: &[OutgoingTask],
    ) -> SyncResult<()> {
        if let Some(key) = sync_key {
            self.store.store_sync_key(account.account_id, Some(key)).await?;
        }

        let (deleted, sent): (Vec<&OutgoingTask>, Vec<&OutgoingTask>) = outgoing.iter().partition(|t| t.deleted);
        let sent: Vec<LocalId> = sent.iter().map(|t| t.id).collect();
        let deleted: Vec<LocalId> = deleted.iter().map(|t| t.id).collect();

        if !sent.is_empty() {
            let pending = [DirtyState::Add, DirtyState::NeedSync].map(DirtyState::as_i64);
            let operations = sent
                .chunks(self.config.batch_size.max(1))
                .map(|part| StoreOperation::Update {
                    kind: EntityKind::Task,
                    selection: Predicate::is_in("id", part.iter().copied())
                        .and(Predicate::is_in("sync_state", pending)),
                    values: Row::new().with("sync_state", DirtyState::Nothing.as_i64()),
                })
                .collect();
            self.store
                .apply_batch(operations)
                .await
                .map_err(|e| SyncError::ApplyFailed(e.to_string()))?;
        }
        if !deleted.is_empty() {
            self.store
                .delete(EntityKind::Task, &deleted)
                .await
                .map_err(|e| SyncError::ApplyFailed(e.to_string()))?;
        }
        Ok(())
    }
}

/// Build the sync request. The sync key, when known, is the first payload
/// line; every task follows as one JSON line.
///
/// # Errors
///
/// Returns `SyncError::Serialization` if a task cannot be encoded.
pub fn build_request<'a>(
    account: &TaskwarriorAccount,
    sync_key: Option<&str>,
    tasks: impl IntoIterator<Item = &'a RemoteTask>,
) -> SyncResult<SyncMessage> {
    let mut message = SyncMessage::new();
    message.set_header("client", CLIENT_ID);
    message.set_header("protocol", PROTOCOL_VERSION);
    message.set_header("type", "sync");
    message.set_header("org", account.org.as_str());
    message.set_header("user", account.user.as_str());
    message.set_header("key", account.user_key.as_str());

    let mut payload = String::new();
    if let Some(key) = sync_key {
        payload.push_str(key);
        payload.push('\n');
    }
    for task in tasks {
        payload.push_str(&task.to_json_line()?);
        payload.push('\n');
    }
    message.set_payload(payload);
    Ok(message)
}
