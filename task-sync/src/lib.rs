//! Taskwarrior synchronization engine for a local task store
//!
//! Provides:
//! - Line-oriented sync message codec
//! - Length-framed, mutually authenticated TLS transport
//! - Translation between local tasks and Taskwarrior JSON tasks
//! - Two-pass reconciliation of remote snapshots into the local store
//! - Sync orchestration with ancestor-mismatch and lost-key recovery

#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::indexing_slicing,
        clippy::panic
    )
)]

pub mod config;
pub mod error;
pub mod local_store;
pub mod message;
pub mod reconcile;
pub mod recurrence;
pub mod store;
pub mod sync;
pub mod translator;
pub mod transport;

pub use config::{SyncConfig, TaskwarriorAccount};
pub use error::{ServerCode, SyncError, SyncResult};
pub use local_store::{LocalStoreConfig, SqliteTaskStore};
pub use message::SyncMessage;
pub use reconcile::{ReconcileReport, Reconciler, Reconciliation};
pub use store::{
    DirtyState, EntityKind, FromRow, HasLocalId, LocalId, Predicate, Row, StoreOperation, TaskStore,
};
pub use sync::{SyncContext, SyncEngine, SyncReport, SyncState};
pub use translator::{Priority, RemoteStatus, RemoteTask};
pub use transport::{Connection, Connector, FramedConnection, TlsConnector};
