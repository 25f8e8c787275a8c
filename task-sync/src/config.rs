//! Sync engine and account configuration

use crate::error::{SyncError, SyncResult};
use crate::store::LocalId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of remote tasks applied in one atomic batch
    pub batch_size: usize,
    /// How many times a rejected sync key is reset before giving up
    pub max_key_resyncs: u32,
    /// Timeout for establishing the TLS connection (in seconds, for serialization)
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Timeout for a single send or receive (in seconds, for serialization)
    #[serde(with = "duration_secs")]
    pub io_timeout: Duration,
    /// Largest response accepted from the server, in bytes
    pub max_message_size: usize,
    /// Name of the list receiving tasks without a project
    pub inbox_name: String,
}

// Serialize Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_key_resyncs: 2,
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
            max_message_size: 64 * 1024 * 1024,
            inbox_name: "Inbox".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from `TASK_SYNC_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Internal` when a variable is set but cannot be parsed.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(batch_size) = env_parse::<usize>("TASK_SYNC_BATCH_SIZE")? {
            config.batch_size = batch_size.max(1);
        }
        if let Some(resyncs) = env_parse::<u32>("TASK_SYNC_MAX_KEY_RESYNCS")? {
            config.max_key_resyncs = resyncs;
        }
        if let Some(secs) = env_parse::<u64>("TASK_SYNC_CONNECT_TIMEOUT_SECONDS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TASK_SYNC_IO_TIMEOUT_SECONDS")? {
            config.io_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("TASK_SYNC_MAX_MESSAGE_SIZE")? {
            config.max_message_size = size;
        }
        if let Ok(name) = std::env::var("TASK_SYNC_INBOX_NAME") {
            config.inbox_name = name;
        }

        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::Internal(format!("Invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// A Taskwarrior server account bound to one local account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskwarriorAccount {
    /// Local account owning the synced lists
    pub account_id: LocalId,
    pub host: String,
    pub port: u16,
    pub org: String,
    pub user: String,
    /// Credential UUID issued by the server for this user
    pub user_key: String,
    /// PEM encoded CA certificate of the server
    pub root_cert: String,
    /// PEM encoded client certificate
    pub client_cert: String,
    /// PEM encoded client private key
    pub client_key: String,
}

impl TaskwarriorAccount {
    /// Label used in logs.
    pub fn label(&self) -> String {
        format!("{}/{}@{}:{}", self.org, self.user, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_key_resyncs, 2);
        assert_eq!(config.inbox_name, "Inbox");
    }

    #[test]
    fn test_config_deserializes_seconds() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"connect_timeout": 5, "batch_size": 10}"#).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.io_timeout, Duration::from_secs(60));
    }
}
