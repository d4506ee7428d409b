//! Configuration types for chat-relay

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Alignment the Graph upload API requires for every non-final chunk (320 KiB)
pub const ONEDRIVE_QUANTUM: usize = 320 * 1024;

/// Largest chunk the Graph upload API accepts in a single request (60 MiB)
pub const ONEDRIVE_MAX_CHUNK: usize = 60 * 1024 * 1024;

/// Transfer pipeline behavior (destination, concurrency, chunking, timeouts)
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Root folder on the drive that every destination path lives under (default: "/Telegram")
    #[serde(default = "default_destination_root")]
    pub destination_root: String,

    /// Maximum concurrently active jobs (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,

    /// Requested chunk size in bytes (default: 5 MiB)
    ///
    /// Rounded down to the store's quantum when a session is opened.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks the reader may hold ahead of the uploader (default: 2)
    #[serde(default = "default_read_ahead")]
    pub read_ahead_chunks: usize,

    /// Timeout for reading one chunk from the source (default: 60 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// Timeout for sending one chunk to the store (default: 120 seconds)
    #[serde(default = "default_send_timeout", with = "duration_serde")]
    pub send_timeout: Duration,

    /// Timeout for a store-side fetch of a remote URL (default: 300 seconds)
    #[serde(default = "default_url_fetch_timeout", with = "duration_serde")]
    pub url_fetch_timeout: Duration,

    /// Let the store fetch remote URLs itself before streaming them locally (default: true)
    #[serde(default = "default_true")]
    pub delegate_url_fetch: bool,

    /// Largest message range a single request may expand to (default: 1000)
    #[serde(default = "default_max_range_count")]
    pub max_range_count: usize,

    /// Message ids resolved per content-proxy call when expanding a range (default: 100)
    #[serde(default = "default_range_page_size")]
    pub range_page_size: usize,

    /// Delete the originating chat message after its job succeeds (default: false)
    ///
    /// Initial value only; toggled at runtime through the relay.
    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            destination_root: default_destination_root(),
            max_concurrent_jobs: default_max_concurrent(),
            chunk_size: default_chunk_size(),
            read_ahead_chunks: default_read_ahead(),
            read_timeout: default_read_timeout(),
            send_timeout: default_send_timeout(),
            url_fetch_timeout: default_url_fetch_timeout(),
            delegate_url_fetch: true,
            max_range_count: default_max_range_count(),
            range_page_size: default_range_page_size(),
            auto_delete: false,
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Status message rendering and edit pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Minimum interval between edits of one status message (default: 2000 ms)
    #[serde(default = "default_edit_interval", with = "millis_serde")]
    pub edit_interval: Duration,

    /// Members listed individually before the summary collapses the rest (default: 20)
    #[serde(default = "default_max_listed_members")]
    pub max_listed_members: usize,

    /// Pending snapshots buffered per group before senders wait (default: 64)
    #[serde(default = "default_status_buffer")]
    pub update_buffer: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            edit_interval: default_edit_interval(),
            max_listed_members: default_max_listed_members(),
            update_buffer: default_status_buffer(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./chat-relay.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long shutdown waits for active jobs to reach a chunk boundary (default: 30 seconds)
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// What the drive does when an item already exists at the destination path
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictBehavior {
    /// Keep both; the drive renames the new item (default)
    #[default]
    Rename,
    /// Overwrite the existing item
    Replace,
    /// Reject the upload with a path conflict
    Fail,
}

impl ConflictBehavior {
    /// Value of the `@microsoft.graph.conflictBehavior` annotation
    pub fn as_graph_value(&self) -> &'static str {
        match self {
            ConflictBehavior::Rename => "rename",
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Fail => "fail",
        }
    }
}

/// OneDrive (Microsoft Graph) backend settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneDriveConfig {
    /// Graph API base URL (default: "https://graph.microsoft.com/v1.0")
    #[serde(default = "default_graph_base")]
    pub api_base: String,

    /// Drive path segment under the API base (default: "me/drive")
    #[serde(default = "default_drive")]
    pub drive: String,

    /// Conflict handling for new uploads
    #[serde(default)]
    pub conflict_behavior: ConflictBehavior,

    /// Poll interval for the async URL-upload monitor (default: 2000 ms)
    #[serde(default = "default_monitor_poll", with = "millis_serde")]
    pub monitor_poll_interval: Duration,

    /// Per-request timeout for Graph calls (default: 120 seconds)
    #[serde(default = "default_send_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for OneDriveConfig {
    fn default() -> Self {
        Self {
            api_base: default_graph_base(),
            drive: default_drive(),
            conflict_behavior: ConflictBehavior::default(),
            monitor_poll_interval: default_monitor_poll(),
            request_timeout: default_send_timeout(),
        }
    }
}

/// Main configuration for the relay
///
/// Fields are organized into sub-configs:
/// - [`transfer`](TransferConfig) - destination root, concurrency, chunking, timeouts
/// - [`retry`](RetryConfig) - backoff for transient failures
/// - [`status`](StatusConfig) - status message pacing
/// - [`persistence`](PersistenceConfig) - database and shutdown
/// - [`onedrive`](OneDriveConfig) - Graph backend
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Transfer pipeline settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry settings for fetches and chunk sends
    #[serde(default)]
    pub retry: RetryConfig,

    /// Status reporter settings
    #[serde(default)]
    pub status: StatusConfig,

    /// Data storage and shutdown
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// OneDrive backend
    #[serde(default)]
    pub onedrive: OneDriveConfig,
}

impl Config {
    /// Load configuration from a JSON file, then validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.max_concurrent_jobs == 0 {
            return Err(config_error(
                "at least one concurrent job is required",
                "transfer.max_concurrent_jobs",
            ));
        }
        if t.chunk_size < ONEDRIVE_QUANTUM {
            return Err(config_error(
                format!("chunk size must be at least {ONEDRIVE_QUANTUM} bytes"),
                "transfer.chunk_size",
            ));
        }
        if t.chunk_size > ONEDRIVE_MAX_CHUNK {
            return Err(config_error(
                format!("chunk size must not exceed {ONEDRIVE_MAX_CHUNK} bytes"),
                "transfer.chunk_size",
            ));
        }
        if t.read_ahead_chunks == 0 {
            return Err(config_error(
                "read-ahead must hold at least one chunk",
                "transfer.read_ahead_chunks",
            ));
        }
        if t.range_page_size == 0 {
            return Err(config_error(
                "range page size must be positive",
                "transfer.range_page_size",
            ));
        }
        if !t.destination_root.starts_with('/') {
            return Err(config_error(
                "destination root must be an absolute drive path",
                "transfer.destination_root",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff multiplier must be at least 1.0",
                "retry.backoff_multiplier",
            ));
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

fn default_destination_root() -> String {
    "/Telegram".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_chunk_size() -> usize {
    16 * ONEDRIVE_QUANTUM
}

fn default_read_ahead() -> usize {
    2
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_url_fetch_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_range_count() -> usize {
    1000
}

fn default_range_page_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_edit_interval() -> Duration {
    Duration::from_millis(2000)
}

fn default_max_listed_members() -> usize {
    20
}

fn default_status_buffer() -> usize {
    64
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./chat-relay.db")
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_graph_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_drive() -> String {
    "me/drive".to_string()
}

fn default_monitor_poll() -> Duration {
    Duration::from_millis(2000)
}

// Duration serialization helper
mod duration_serde {
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

// Millisecond Duration serialization helper
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
