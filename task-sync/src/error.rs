//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Server rejected sync (code {code}): {status}")]
    ServerRejected { code: u16, status: String },

    #[error("Server could not find a common ancestor for the sync key")]
    AncestorMismatch,

    #[error("Client sync key not found by server after {attempts} attempts")]
    SyncKeyNotFound { attempts: u32 },

    #[error("Atomic apply failed: {0}")]
    ApplyFailed(String),

    #[error("Unsupported recurrence: {0}")]
    UnsupportedRecurrence(String),

    #[error("Remote task {0} is deleted")]
    DeletedTask(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Per-task errors that reconciliation absorbs instead of failing the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::UnsupportedRecurrence(_) | SyncError::DeletedTask(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Response codes returned by a Taskwarrior server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCode {
    Ok,
    NoChange,
    Deprecated,
    DeprecatedRequestType,
    Redirect,
    Retry,
    MalformedData,
    UnsupportedEncoding,
    ServerUnavailable,
    ShuttingDown,
    AccessDenied,
    AccountSuspended,
    AccountTerminated,
    SyntaxError,
    IllegalParameters,
    NotImplemented,
    ParameterNotImplemented,
    RequestTooBig,
    Unknown(u16),
}

impl ServerCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => ServerCode::Ok,
            201 => ServerCode::NoChange,
            202 => ServerCode::Deprecated,
            300 => ServerCode::DeprecatedRequestType,
            301 => ServerCode::Redirect,
            302 => ServerCode::Retry,
            400 => ServerCode::MalformedData,
            401 => ServerCode::UnsupportedEncoding,
            420 => ServerCode::ServerUnavailable,
            421 => ServerCode::ShuttingDown,
            430 => ServerCode::AccessDenied,
            431 => ServerCode::AccountSuspended,
            432 => ServerCode::AccountTerminated,
            500 => ServerCode::SyntaxError,
            501 => ServerCode::IllegalParameters,
            502 => ServerCode::NotImplemented,
            503 => ServerCode::ParameterNotImplemented,
            504 => ServerCode::RequestTooBig,
            other => ServerCode::Unknown(other),
        }
    }

    /// 200-class codes mean the exchange succeeded.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ServerCode::Ok | ServerCode::NoChange | ServerCode::Deprecated
        ) || matches!(self, ServerCode::Unknown(code) if (200..300).contains(&code))
    }
}
