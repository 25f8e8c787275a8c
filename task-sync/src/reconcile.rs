//! Reconciliation of a remote task snapshot into the local store
//!
//! Runs in two passes. The first pass writes task rows in bounded atomic
//! batches and builds the UUID to local id mapping. The second pass links
//! tags, subtasks and recurrences once every task of the snapshot has a
//! local id, so forward references resolve.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::recurrence::{RecurrenceInterval, StoredRecurrence};
use crate::store::{
    fetch, query_in, EntityKind, FromRow, ListRecord, LocalId, LocalTask, Predicate, Row, StoreOperation,
    SubtaskLink, TagLink, TagRecord, TaskStore,
};
use crate::translator::RemoteTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Counters of one reconciliation run
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Remote deletions of tasks never seen locally
    pub skipped: usize,
    pub skipped_references: usize,
    pub skipped_recurrences: usize,
    /// Local rows left as they are because their changes were not uploaded
    pub kept_local: usize,
    /// Operation count of every task batch applied
    pub task_batches: Vec<usize>,
}

/// Result of reconciling a snapshot
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub report: ReconcileReport,
    /// Local id of every non-deleted remote task
    pub ids: HashMap<String, LocalId>,
}

/// State carried between the task batches of one run
#[derive(Default)]
struct RunState {
    ids: HashMap<String, LocalId>,
    /// `tasks.recurring` of every row touched by this run before the run
    recurring: HashMap<LocalId, Option<LocalId>>,
    /// Rows holding unsent local changes; the link pass skips them
    kept: HashSet<LocalId>,
    deleted: Vec<LocalId>,
    report: ReconcileReport,
}

impl RunState {
    fn recurring_of(&self, task: LocalId) -> Option<LocalId> {
        self.recurring.get(&task).copied().flatten()
    }
}

/// One recurrence master; children point at it by arena index.
struct RecurrenceRecord {
    master_task: LocalId,
    recurring_id: Option<LocalId>,
    interval: RecurrenceInterval,
    start: Option<DateTime<Utc>>,
}

struct RecurrenceChild {
    parent: usize,
    child_task: LocalId,
    offset: u32,
}

#[derive(Default)]
struct RecurrenceArena {
    records: Vec<RecurrenceRecord>,
    by_master: HashMap<String, usize>,
    children: Vec<RecurrenceChild>,
}

impl RecurrenceArena {
    fn push(&mut self, master_uuid: &str, record: RecurrenceRecord) -> usize {
        let index = self.records.len();
        self.records.push(record);
        self.by_master.insert(master_uuid.to_string(), index);
        index
    }
}

/// Applies remote snapshots for one account
pub struct Reconciler<'a, S: TaskStore + ?Sized> {
    store: &'a S,
    account_id: LocalId,
    inbox_name: &'a str,
    batch_size: usize,
    sent: HashSet<LocalId>,
}

impl<'a, S: TaskStore + ?Sized> Reconciler<'a, S> {
    pub fn new(store: &'a S, account_id: LocalId, config: &'a SyncConfig) -> Self {
        Self {
            store,
            account_id,
            inbox_name: &config.inbox_name,
            batch_size: config.batch_size.max(1),
            sent: HashSet::new(),
        }
    }

    /// Local ids uploaded in the request this snapshot answers.
    ///
    /// Existing rows marked ADD, NEED_SYNC or DELETE that are not in `sent`
    /// are left untouched so the next sync uploads them.
    pub fn with_sent(mut self, sent: impl IntoIterator<Item = LocalId>) -> Self {
        self.sent = sent.into_iter().collect();
        self
    }

    /// Merge `remote_tasks` into the local store.
    ///
    /// Per-task problems (deleted tasks, unsupported recurrences, dangling
    /// references) are absorbed and counted.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::ApplyFailed` when an atomic batch is rejected by
    /// the store, and propagates query failures.
    pub async fn reconcile(&self, remote_tasks: Vec<RemoteTask>) -> SyncResult<Reconciliation> {
        let tasks = dedupe(remote_tasks);
        let mut state = RunState::default();
        if tasks.is_empty() {
            return Ok(Reconciliation::default());
        }

        // provision once for the whole snapshot, never per batch
        let lists = self.provision_lists(&tasks).await?;
        let inbox = lists
            .get(self.inbox_name)
            .copied()
            .ok_or_else(|| SyncError::Internal("inbox list was not provisioned".into()))?;
        let tags = self.provision_tags(&tasks).await?;

        for chunk in tasks.chunks(self.batch_size) {
            self.apply_chunk(chunk, &lists, inbox, &mut state).await?;
        }

        if !state.deleted.is_empty() {
            let removed = self
                .store
                .delete(EntityKind::Task, &state.deleted)
                .await
                .map_err(apply_failed)?;
            tracing::debug!(requested = state.deleted.len(), removed, "Deleted tasks removed remotely");
            state.report.deleted = state.deleted.len();
        }

        self.link_references(&tasks, &tags, &mut state).await?;

        tracing::info!(
            account = self.account_id,
            inserted = state.report.inserted,
            updated = state.report.updated,
            unchanged = state.report.unchanged,
            deleted = state.report.deleted,
            "Reconciled remote tasks"
        );

        Ok(Reconciliation {
            report: state.report,
            ids: state.ids,
        })
    }

    async fn provision_lists(&self, tasks: &[RemoteTask]) -> SyncResult<HashMap<String, LocalId>> {
        let mut names: BTreeSet<String> = tasks
            .iter()
            .filter(|t| !t.is_deleted())
            .filter_map(|t| t.project.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        names.insert(self.inbox_name.to_string());

        let predicate = Predicate::eq("account_id", self.account_id)
            .and(Predicate::is_in("name", names.iter().cloned()));
        let existing: Vec<ListRecord> = fetch(self.store, EntityKind::List, &predicate).await?;
        let mut mapping: HashMap<String, LocalId> =
            existing.into_iter().map(|list| (list.name, list.id)).collect();

        let missing: Vec<String> = names
            .into_iter()
            .filter(|name| !mapping.contains_key(name))
            .collect();
        let now = Utc::now().timestamp();
        let operations = missing
            .iter()
            .map(|name| StoreOperation::Insert {
                kind: EntityKind::List,
                values: Row::new()
                    .with("account_id", self.account_id)
                    .with("name", name.as_str())
                    .with("created_at", now),
            })
            .collect();

        let assigned = self.apply(operations).await?;
        for (name, id) in missing.into_iter().zip(assigned) {
            let id = id.ok_or_else(|| SyncError::Internal(format!("no id for new list {}", name)))?;
            tracing::info!(account = self.account_id, list = %name, "Created list for project");
            mapping.insert(name, id);
        }
        Ok(mapping)
    }

    async fn provision_tags(&self, tasks: &[RemoteTask]) -> SyncResult<HashMap<String, LocalId>> {
        let names: BTreeSet<String> = tasks
            .iter()
            .filter(|t| !t.is_deleted())
            .flat_map(|t| t.local_tag_names())
            .collect();
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let existing: Vec<TagRecord> = fetch(
            self.store,
            EntityKind::Tag,
            &Predicate::is_in("name", names.iter().cloned()),
        )
        .await?;
        let mut mapping: HashMap<String, LocalId> =
            existing.into_iter().map(|tag| (tag.name, tag.id)).collect();

        let missing: Vec<String> = names
            .into_iter()
            .filter(|name| !mapping.contains_key(name))
            .collect();
        let operations = missing
            .iter()
            .map(|name| StoreOperation::Insert {
                kind: EntityKind::Tag,
                values: Row::new().with("name", name.as_str()),
            })
            .collect();

        let assigned = self.apply(operations).await?;
        for (name, id) in missing.into_iter().zip(assigned) {
            let id = id.ok_or_else(|| SyncError::Internal(format!("no id for new tag {}", name)))?;
            tracing::debug!(tag = %name, "Created tag");
            mapping.insert(name, id);
        }
        Ok(mapping)
    }

    /// First pass for one batch: queue updates and inserts, apply them
    /// atomically, then resolve ids of the inserted rows.
    async fn apply_chunk(
        &self,
        chunk: &[RemoteTask],
        lists: &HashMap<String, LocalId>,
        inbox: LocalId,
        state: &mut RunState,
    ) -> SyncResult<()> {
        let predicate = Predicate::is_in("uuid", chunk.iter().map(|t| t.uuid.as_str()));
        let mut existing: HashMap<String, (LocalTask, Row)> = HashMap::new();
        for row in self.store.query(EntityKind::Task, &predicate).await? {
            let task = LocalTask::from_row(&row)?;
            existing.insert(task.uuid.clone(), (task, row));
        }

        let mut operations = Vec::with_capacity(chunk.len());
        let mut pending: Vec<&str> = Vec::new();

        for remote in chunk {
            let list_id = remote
                .project
                .as_deref()
                .and_then(|project| lists.get(project.trim()))
                .copied()
                .unwrap_or(inbox);

            match existing.get(&remote.uuid) {
                Some((local, _)) if local.sync_state.is_dirty() && !self.sent.contains(&local.id) => {
                    tracing::info!(uuid = %remote.uuid, "Task has unsent local changes, keeping local version");
                    state.report.kept_local += 1;
                    state.kept.insert(local.id);
                    if !remote.is_deleted() {
                        state.ids.insert(remote.uuid.clone(), local.id);
                    }
                }
                Some((local, row)) => {
                    state.recurring.insert(local.id, local.recurring);
                    match remote.to_local_values(list_id) {
                        Ok(values) => {
                            let changes = values.diff(row);
                            if changes.is_empty() {
                                state.report.unchanged += 1;
                            } else {
                                operations.push(StoreOperation::Update {
                                    kind: EntityKind::Task,
                                    selection: Predicate::eq("id", local.id),
                                    values: changes,
                                });
                                state.report.updated += 1;
                            }
                            state.ids.insert(remote.uuid.clone(), local.id);
                        }
                        Err(SyncError::DeletedTask(uuid)) => {
                            tracing::debug!(uuid = %uuid, "Remote task deleted, removing local row");
                            state.deleted.push(local.id);
                        }
                        Err(e) => return Err(e),
                    }
                }
                None => match remote.to_local_values(list_id) {
                    Ok(values) => {
                        operations.push(StoreOperation::Insert {
                            kind: EntityKind::Task,
                            values,
                        });
                        pending.push(remote.uuid.as_str());
                    }
                    Err(SyncError::DeletedTask(uuid)) => {
                        tracing::debug!(uuid = %uuid, "Remote task deleted and unknown locally");
                        state.report.skipped += 1;
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        if operations.is_empty() {
            return Ok(());
        }
        state.report.task_batches.push(operations.len());
        self.apply(operations).await?;

        if !pending.is_empty() {
            let inserted: Vec<LocalTask> = fetch(
                self.store,
                EntityKind::Task,
                &Predicate::is_in("uuid", pending.iter().copied()),
            )
            .await?;
            if inserted.len() != pending.len() {
                tracing::warn!(
                    expected = pending.len(),
                    found = inserted.len(),
                    "Not every inserted task could be read back"
                );
            }
            state.report.inserted += inserted.len();
            for task in inserted {
                state.recurring.insert(task.id, task.recurring);
                state.ids.insert(task.uuid, task.id);
            }
        }
        Ok(())
    }

    /// Second pass: tags, subtasks and recurrences.
    async fn link_references(
        &self,
        tasks: &[RemoteTask],
        tags: &HashMap<String, LocalId>,
        state: &mut RunState,
    ) -> SyncResult<()> {
        let live: Vec<(&RemoteTask, LocalId)> = tasks
            .iter()
            .filter(|t| !t.is_deleted())
            .filter_map(|t| state.ids.get(&t.uuid).map(|id| (t, *id)))
            .filter(|(_, id)| !state.kept.contains(id))
            .collect();
        if live.is_empty() {
            return Ok(());
        }
        let task_ids: Vec<LocalId> = live.iter().map(|(_, id)| *id).collect();

        let mut operations = self.link_tags(&live, &task_ids, tags).await?;
        operations.extend(self.link_subtasks(&live, &task_ids, state).await?);
        operations.extend(self.link_recurrences(&live, state).await?);

        self.apply(operations).await?;
        Ok(())
    }

    async fn link_tags(
        &self,
        live: &[(&RemoteTask, LocalId)],
        task_ids: &[LocalId],
        tags: &HashMap<String, LocalId>,
    ) -> SyncResult<Vec<StoreOperation>> {
        let mut desired: HashSet<(LocalId, LocalId)> = HashSet::new();
        for (remote, task_id) in live {
            for name in remote.local_tag_names() {
                if let Some(tag_id) = tags.get(&name) {
                    desired.insert((*task_id, *tag_id));
                }
            }
        }

        let current: Vec<TagLink> = self.fetch_in(EntityKind::TagLink, "task_id", task_ids).await?;
        let mut current: HashMap<(LocalId, LocalId), LocalId> = current
            .into_iter()
            .map(|link| ((link.task_id, link.tag_id), link.id))
            .collect();

        let mut operations = Vec::new();
        let mut additions: Vec<_> = desired
            .into_iter()
            .filter(|pair| current.remove(pair).is_none())
            .collect();
        additions.sort_unstable();
        for (task_id, tag_id) in additions {
            operations.push(StoreOperation::Insert {
                kind: EntityKind::TagLink,
                values: Row::new().with("task_id", task_id).with("tag_id", tag_id),
            });
        }
        if !current.is_empty() {
            operations.push(StoreOperation::Delete {
                kind: EntityKind::TagLink,
                selection: Predicate::is_in("id", current.into_values()),
            });
        }
        Ok(operations)
    }

    async fn link_subtasks(
        &self,
        live: &[(&RemoteTask, LocalId)],
        task_ids: &[LocalId],
        state: &mut RunState,
    ) -> SyncResult<Vec<StoreOperation>> {
        // dependencies may point at tasks outside this snapshot
        let unresolved: BTreeSet<&str> = live
            .iter()
            .flat_map(|(remote, _)| remote.depends.iter())
            .map(String::as_str)
            .filter(|uuid| !state.ids.contains_key(*uuid))
            .collect();
        let mut outside: HashMap<String, LocalId> = HashMap::new();
        if !unresolved.is_empty() {
            let found: Vec<LocalTask> = fetch(
                self.store,
                EntityKind::Task,
                &Predicate::is_in("uuid", unresolved.iter().copied()),
            )
            .await?;
            outside.extend(found.into_iter().map(|task| (task.uuid, task.id)));
        }

        let mut desired: HashSet<(LocalId, LocalId)> = HashSet::new();
        for (remote, parent_id) in live {
            for child in &remote.depends {
                match state.ids.get(child).or_else(|| outside.get(child)) {
                    Some(child_id) => {
                        desired.insert((*parent_id, *child_id));
                    }
                    None => {
                        tracing::warn!(task = %remote.uuid, depends = %child, "Dependency has no local task, skipping");
                        state.report.skipped_references += 1;
                    }
                }
            }
        }

        let current: Vec<SubtaskLink> = self.fetch_in(EntityKind::Subtask, "parent_id", task_ids).await?;
        let mut current: HashMap<(LocalId, LocalId), LocalId> = current
            .into_iter()
            .map(|link| ((link.parent_id, link.child_id), link.id))
            .collect();

        let mut operations = Vec::new();
        let mut additions: Vec<_> = desired
            .into_iter()
            .filter(|pair| current.remove(pair).is_none())
            .collect();
        additions.sort_unstable();
        for (parent_id, child_id) in additions {
            operations.push(StoreOperation::Insert {
                kind: EntityKind::Subtask,
                values: Row::new().with("parent_id", parent_id).with("child_id", child_id),
            });
        }
        if !current.is_empty() {
            operations.push(StoreOperation::Delete {
                kind: EntityKind::Subtask,
                selection: Predicate::is_in("id", current.into_values()),
            });
        }
        Ok(operations)
    }

    /// Create or refresh recurring records of masters, then point masters
    /// and their generated instances at them.
    async fn link_recurrences(
        &self,
        live: &[(&RemoteTask, LocalId)],
        state: &mut RunState,
    ) -> SyncResult<Vec<StoreOperation>> {
        let mut arena = RecurrenceArena::default();

        let masters: Vec<(&RemoteTask, LocalId, RecurrenceInterval)> = live
            .iter()
            .filter(|(remote, _)| remote.is_recurring_master())
            .filter_map(|(remote, task_id)| match remote.recurrence() {
                Ok(Some(interval)) => Some((*remote, *task_id, interval)),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(task = %remote.uuid, error = %e, "Skipping recurrence");
                    state.report.skipped_recurrences += 1;
                    None
                }
            })
            .collect();

        let known_ids: Vec<LocalId> = masters
            .iter()
            .filter_map(|(_, task_id, _)| state.recurring_of(*task_id))
            .collect();
        let stored: HashMap<LocalId, Row> = self
            .fetch_rows_in(EntityKind::Recurring, "id", &known_ids)
            .await?
            .into_iter()
            .filter_map(|row| row.i64("id").ok().map(|id| (id, row)))
            .collect();

        let mut record_ops = Vec::new();
        let mut inserted_slots = Vec::new();
        for (remote, task_id, interval) in masters {
            let values = interval.to_row(
                remote.recur.as_deref().unwrap_or_default(),
                remote.due.map(|d| d.timestamp()),
                remote.until.map(|d| d.timestamp()),
            );
            let slot = arena.records.len();
            let recurring_id = match state.recurring_of(task_id).filter(|id| stored.contains_key(id)) {
                Some(id) => {
                    let changes = stored.get(&id).map(|row| values.diff(row)).unwrap_or_default();
                    if !changes.is_empty() {
                        record_ops.push(StoreOperation::Update {
                            kind: EntityKind::Recurring,
                            selection: Predicate::eq("id", id),
                            values: changes,
                        });
                    }
                    Some(id)
                }
                None => {
                    record_ops.push(StoreOperation::Insert {
                        kind: EntityKind::Recurring,
                        values,
                    });
                    inserted_slots.push(slot);
                    None
                }
            };
            arena.push(
                &remote.uuid,
                RecurrenceRecord {
                    master_task: task_id,
                    recurring_id,
                    interval,
                    start: remote.due,
                },
            );
        }

        let assigned = self.apply(record_ops).await?;
        for (slot, id) in inserted_slots.into_iter().zip(assigned.into_iter().flatten()) {
            if let Some(record) = arena.records.get_mut(slot) {
                record.recurring_id = Some(id);
            }
        }

        self.load_outside_masters(live, state, &mut arena).await?;

        for (remote, task_id) in live.iter().filter(|(r, _)| r.is_recurring_child()) {
            let parent = remote.parent.as_deref().and_then(|uuid| arena.by_master.get(uuid));
            match (parent, remote.imask()) {
                (Some(parent), Some(offset)) => arena.children.push(RecurrenceChild {
                    parent: *parent,
                    child_task: *task_id,
                    offset,
                }),
                _ => {
                    tracing::warn!(task = %remote.uuid, "Recurrence parent unknown, skipping");
                    state.report.skipped_references += 1;
                }
            }
        }

        let mut operations = Vec::new();
        for record in &arena.records {
            if let Some(id) = record.recurring_id {
                if state.recurring_of(record.master_task) != Some(id) {
                    operations.push(set_recurring(record.master_task, id));
                }
            }
        }

        let child_ids: Vec<LocalId> = arena.children.iter().map(|c| c.child_task).collect();
        let existing_children: HashMap<LocalId, Row> = self
            .fetch_rows_in(EntityKind::RecurringChild, "child_id", &child_ids)
            .await?
            .into_iter()
            .filter_map(|row| row.i64("child_id").ok().map(|id| (id, row)))
            .collect();

        for child in &arena.children {
            let Some(record) = arena.records.get(child.parent) else {
                continue;
            };
            if let Some(id) = record.recurring_id {
                if state.recurring_of(child.child_task) != Some(id) {
                    operations.push(set_recurring(child.child_task, id));
                }
            }

            let due_override = record
                .start
                .and_then(|start| record.interval.apply_offset(start, child.offset))
                .map(|d| d.timestamp());
            let values = Row::new()
                .with("parent_id", record.master_task)
                .with("child_id", child.child_task)
                .with("offset_count", i64::from(child.offset))
                .with("due_override", due_override);

            match existing_children.get(&child.child_task) {
                Some(row) => {
                    let changes = values.diff(row);
                    if !changes.is_empty() {
                        operations.push(StoreOperation::Update {
                            kind: EntityKind::RecurringChild,
                            selection: Predicate::eq("id", row.i64("id")?),
                            values: changes,
                        });
                    }
                }
                None => operations.push(StoreOperation::Insert {
                    kind: EntityKind::RecurringChild,
                    values,
                }),
            }
        }

        Ok(operations)
    }

    /// Children whose master is not part of this snapshot attach to the
    /// master's stored recurrence.
    async fn load_outside_masters(
        &self,
        live: &[(&RemoteTask, LocalId)],
        state: &mut RunState,
        arena: &mut RecurrenceArena,
    ) -> SyncResult<()> {
        let missing: BTreeSet<&str> = live
            .iter()
            .filter(|(remote, _)| remote.is_recurring_child())
            .filter_map(|(remote, _)| remote.parent.as_deref())
            .filter(|uuid| !arena.by_master.contains_key(*uuid))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let masters: Vec<LocalTask> = fetch(
            self.store,
            EntityKind::Task,
            &Predicate::is_in("uuid", missing.iter().copied()),
        )
        .await?;
        let recurring_ids: Vec<LocalId> = masters.iter().filter_map(|m| m.recurring).collect();
        let stored: HashMap<LocalId, StoredRecurrence> = self
            .fetch_in::<StoredRecurrence>(EntityKind::Recurring, "id", &recurring_ids)
            .await?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        for master in masters {
            let Some(recurrence) = master.recurring.and_then(|id| stored.get(&id)) else {
                continue;
            };
            state.recurring.entry(master.id).or_insert(master.recurring);
            arena.push(
                &master.uuid,
                RecurrenceRecord {
                    master_task: master.id,
                    recurring_id: Some(recurrence.id),
                    interval: recurrence.interval,
                    start: recurrence
                        .start_date
                        .and_then(|secs| DateTime::from_timestamp(secs, 0)),
                },
            );
        }
        Ok(())
    }

    async fn apply(&self, operations: Vec<StoreOperation>) -> SyncResult<Vec<Option<LocalId>>> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let count = operations.len();
        self.store.apply_batch(operations).await.map_err(|e| {
            tracing::error!(operations = count, error = %e, "Atomic apply failed");
            apply_failed(e)
        })
    }

    async fn fetch_rows_in(&self, kind: EntityKind, column: &str, ids: &[LocalId]) -> SyncResult<Vec<Row>> {
        query_in(self.store, kind, column, ids, self.batch_size).await
    }

    async fn fetch_in<T: FromRow>(&self, kind: EntityKind, column: &str, ids: &[LocalId]) -> SyncResult<Vec<T>> {
        self.fetch_rows_in(kind, column, ids)
            .await?
            .iter()
            .map(T::from_row)
            .collect()
    }
}

fn set_recurring(task: LocalId, recurring: LocalId) -> StoreOperation {
    StoreOperation::Update {
        kind: EntityKind::Task,
        selection: Predicate::eq("id", task),
        values: Row::new().with("recurring", recurring),
    }
}

fn apply_failed(err: SyncError) -> SyncError {
    match err {
        SyncError::ApplyFailed(_) => err,
        other => SyncError::ApplyFailed(other.to_string()),
    }
}

/// Keep the first position of every UUID, with the content of its last
/// occurrence.
fn dedupe(tasks: Vec<RemoteTask>) -> Vec<RemoteTask> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(tasks.len());
    let mut out: Vec<RemoteTask> = Vec::with_capacity(tasks.len());
    for task in tasks {
        match positions.get(&task.uuid) {
            Some(&index) => {
                if let Some(slot) = out.get_mut(index) {
                    *slot = task;
                }
            }
            None => {
                positions.insert(task.uuid.clone(), out.len());
                out.push(task);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(json: &str) -> RemoteTask {
        RemoteTask::from_json_line(json).unwrap()
    }

    #[test]
    fn test_dedupe_keeps_last_content_first_position() {
        let tasks = vec![
            task(r#"{"uuid":"a","status":"pending","description":"old"}"#),
            task(r#"{"uuid":"b","status":"pending"}"#),
            task(r#"{"uuid":"a","status":"completed","description":"new"}"#),
        ];
        let out = dedupe(tasks);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].uuid, "a");
        assert_eq!(out[0].description, "new");
        assert_eq!(out[1].uuid, "b");
    }

    #[test]
    fn test_apply_failed_preserves_cause() {
        let err = apply_failed(SyncError::Internal("constraint".into()));
        assert!(matches!(err, SyncError::ApplyFailed(msg) if msg.contains("constraint")));
    }
}
