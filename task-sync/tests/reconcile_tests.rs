//! Integration tests for reconciling remote snapshots into SQLite
//!
//! These tests verify that:
//! 1. Task writes are split into bounded atomic batches
//! 2. Every live remote task ends up in the id mapping
//! 3. Replaying a snapshot writes nothing
//! 4. Forward references and recurrence chains are linked after insertion

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

mod common;

use common::{init_tracing, task_json, RecordingStore, ACCOUNT};
use task_sync::store::{fetch, LocalTask, SubtaskLink, TagLink};
use task_sync::{DirtyState, EntityKind, Predicate, Reconciler, RemoteTask, SyncConfig, SyncError};
use uuid::Uuid;

fn remote(lines: &[String]) -> Vec<RemoteTask> {
    lines
        .iter()
        .map(|line| RemoteTask::from_json_line(line).expect("Failed to parse task"))
        .collect()
}

async fn tasks(store: &RecordingStore) -> Vec<LocalTask> {
    fetch(store, EntityKind::Task, &Predicate::All).await.unwrap()
}

#[tokio::test]
async fn test_batches_split_at_batch_size() {
    init_tracing();
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    let lines: Vec<String> = (0..250)
        .map(|_| task_json(&Uuid::new_v4().to_string(), "pending", ""))
        .collect();

    let result = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();

    assert_eq!(result.report.task_batches, vec![100, 100, 50]);
    assert_eq!(store.task_batch_sizes(), vec![100, 100, 50]);
    assert_eq!(result.report.inserted, 250);
    assert_eq!(tasks(&store).await.len(), 250);
}

#[tokio::test]
async fn test_every_live_uuid_is_mapped() {
    let store = RecordingStore::new().await;
    let config = SyncConfig {
        batch_size: 7,
        ..SyncConfig::default()
    };
    let inbox = store.seed_list("Inbox").await;
    store.seed_task(inbox, "existing-1", "Old name", 0).await;
    store.seed_task(inbox, "existing-2", "Doomed", 0).await;

    let mut lines: Vec<String> = (0..20)
        .map(|i| task_json(&format!("new-{}", i), "pending", r#""project":"Home""#))
        .collect();
    lines.push(task_json("existing-1", "completed", ""));
    lines.push(task_json("existing-2", "deleted", ""));
    lines.push(task_json("never-seen", "deleted", ""));

    let result = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();

    for i in 0..20 {
        assert!(result.ids.contains_key(&format!("new-{}", i)));
    }
    assert!(result.ids.contains_key("existing-1"));
    assert!(!result.ids.contains_key("existing-2"));
    assert!(!result.ids.contains_key("never-seen"));

    assert_eq!(result.report.inserted, 20);
    assert_eq!(result.report.updated, 1);
    assert_eq!(result.report.deleted, 1);
    assert_eq!(result.report.skipped, 1);

    let local = tasks(&store).await;
    assert_eq!(local.len(), 21);
    let updated = local.iter().find(|t| t.uuid == "existing-1").unwrap();
    assert!(updated.done);
    assert_eq!(updated.name, "Task existing-1");
}

#[tokio::test]
async fn test_replaying_snapshot_writes_nothing() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    let lines = vec![
        task_json("parent", "pending", r#""project":"Work","tags":["urgent","big_rock"],"depends":"child""#),
        task_json("child", "pending", r#""project":"Work","priority":"H","annotations":[{"entry":"20240301T100000Z","description":"call back"}]"#),
        task_json(
            "master",
            "recurring",
            r#""recur":"weekly","due":"20240304T090000Z","mask":"-+""#,
        ),
        task_json(
            "instance",
            "pending",
            r#""recur":"weekly","parent":"master","imask":1,"due":"20240311T090000Z""#,
        ),
    ];

    let first = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();
    assert_eq!(first.report.inserted, 4);
    let writes = store.write_count();

    let second = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();

    assert_eq!(store.write_count(), writes, "second run must not write");
    assert_eq!(second.report.unchanged, 4);
    assert_eq!(second.report.updated, 0);
    assert!(second.report.task_batches.is_empty());
    assert_eq!(first.ids, second.ids);
}

#[tokio::test]
async fn test_projects_and_tags_provisioned_once() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    let lines = vec![
        task_json("a", "pending", r#""project":"Work","tags":["urgent"]"#),
        task_json("b", "pending", r#""project":" Work ","tags":["urgent"]"#),
    ];

    for _ in 0..2 {
        Reconciler::new(&store, ACCOUNT, &config)
            .reconcile(remote(&lines))
            .await
            .unwrap();
    }

    let lists = store
        .rows(EntityKind::List, Predicate::eq("name", "Work"))
        .await;
    assert_eq!(lists.len(), 1);
    let tags = store.rows(EntityKind::Tag, Predicate::eq("name", "urgent")).await;
    assert_eq!(tags.len(), 1);
    let inbox = store.rows(EntityKind::List, Predicate::eq("name", "Inbox")).await;
    assert_eq!(inbox.len(), 1);
}

#[tokio::test]
async fn test_forward_dependency_is_linked() {
    let store = RecordingStore::new().await;
    let config = SyncConfig {
        batch_size: 1,
        ..SyncConfig::default()
    };
    let lines = vec![
        task_json("first", "pending", r#""depends":["second","missing"]"#),
        task_json("second", "pending", ""),
    ];

    let result = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();
    assert_eq!(result.report.skipped_references, 1);

    let links: Vec<SubtaskLink> = fetch(&store, EntityKind::Subtask, &Predicate::All).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].parent_id, result.ids["first"]);
    assert_eq!(links[0].child_id, result.ids["second"]);
}

#[tokio::test]
async fn test_stale_tag_links_are_removed() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();

    Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&[task_json("t", "pending", r#""tags":["home","errand"]"#)]))
        .await
        .unwrap();
    Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&[task_json("t", "pending", r#""tags":["home"]"#)]))
        .await
        .unwrap();

    let links: Vec<TagLink> = fetch(&store, EntityKind::TagLink, &Predicate::All).await.unwrap();
    assert_eq!(links.len(), 1);
    let home = store.rows(EntityKind::Tag, Predicate::eq("name", "home")).await;
    assert_eq!(links[0].tag_id, home[0].i64("id").unwrap());
}

#[tokio::test]
async fn test_recurrence_chain_is_linked() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    let lines = vec![
        task_json("child-2", "pending", r#""parent":"master","imask":2,"recur":"2d""#),
        task_json("master", "recurring", r#""recur":"2d","due":"20240301T080000Z""#),
        task_json("child-1", "pending", r#""parent":"master","imask":1,"recur":"2d""#),
    ];

    let result = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();

    let recurring = store.rows(EntityKind::Recurring, Predicate::All).await;
    assert_eq!(recurring.len(), 1);
    let recurring_id = recurring[0].i64("id").unwrap();
    assert_eq!(recurring[0].i64("days").unwrap(), 2);

    let local = tasks(&store).await;
    assert!(local.iter().all(|t| t.recurring == Some(recurring_id)));

    let children = store.rows(EntityKind::RecurringChild, Predicate::All).await;
    assert_eq!(children.len(), 2);
    let second = children
        .iter()
        .find(|row| row.i64("child_id").unwrap() == result.ids["child-2"])
        .unwrap();
    assert_eq!(second.i64("parent_id").unwrap(), result.ids["master"]);
    assert_eq!(second.i64("offset_count").unwrap(), 2);
    // 2024-03-05T08:00:00Z
    assert_eq!(second.i64("due_override").unwrap(), 1_709_625_600);
}

#[tokio::test]
async fn test_unsupported_recurrence_skips_only_the_link() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    let lines = vec![
        task_json("master", "recurring", r#""recur":"30s","due":"20240301T080000Z""#),
        task_json("plain", "pending", ""),
    ];

    let result = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap();

    assert_eq!(result.report.skipped_recurrences, 1);
    assert_eq!(result.report.inserted, 2);
    assert!(store.rows(EntityKind::Recurring, Predicate::All).await.is_empty());
}

#[tokio::test]
async fn test_failed_batch_commits_nothing() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    store.poison_task_batches();

    let lines: Vec<String> = (0..3)
        .map(|i| task_json(&format!("t-{}", i), "pending", ""))
        .collect();
    let err = Reconciler::new(&store, ACCOUNT, &config)
        .reconcile(remote(&lines))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::ApplyFailed(_)), "unexpected error {:?}", err);
    assert!(tasks(&store).await.is_empty());
    assert!(store
        .rows(EntityKind::Tag, Predicate::eq("name", "poison"))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_unsent_local_changes_are_kept() {
    let store = RecordingStore::new().await;
    let config = SyncConfig::default();
    let inbox = store.seed_list("Inbox").await;
    let edited = store.seed_task(inbox, "edited", "Local wording", 2).await;
    let uploaded = store.seed_task(inbox, "uploaded", "Local wording", 2).await;
    let lines = vec![
        task_json("edited", "pending", r#""tags":["server"]"#),
        task_json("uploaded", "pending", r#""tags":["server"]"#),
    ];

    let result = Reconciler::new(&store, ACCOUNT, &config)
        .with_sent([uploaded])
        .reconcile(remote(&lines))
        .await
        .unwrap();

    assert_eq!(result.report.kept_local, 1);
    assert_eq!(result.report.updated, 1);
    assert_eq!(result.ids["edited"], edited);

    let local = tasks(&store).await;
    let kept = local.iter().find(|t| t.uuid == "edited").unwrap();
    assert_eq!(kept.name, "Local wording");
    assert_eq!(kept.sync_state, DirtyState::NeedSync);
    let refreshed = local.iter().find(|t| t.uuid == "uploaded").unwrap();
    assert_eq!(refreshed.name, "Task uploaded");
    assert_eq!(refreshed.sync_state, DirtyState::Nothing);

    let links: Vec<TagLink> = fetch(&store, EntityKind::TagLink, &Predicate::All).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].task_id, uploaded);
}
