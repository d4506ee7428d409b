//! Error types for chat-relay
//!
//! The taxonomy separates failures by where they originate and whether they can be retried:
//! - [`FetchError`] - the source could not be read (retriable unless access was denied)
//! - [`StoreError`] - the destination store failed; transient chunk-send failures are kept
//!   apart from terminal [`StoreRejection`]s (quota, expired authorization, path conflict)
//! - [`JobError`] - invalid operations on a job's state machine
//! - [`DatabaseError`] - persistence failures
//!
//! Cooperative cancellation is not an error; jobs that observe it end in `Canceled`.

use thiserror::Error;

use crate::types::{GroupId, JobId, JobState};

/// Result type alias for chat-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for chat-relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "transfer.chunk_size")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Source could not be read
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Destination store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Job state machine violation
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Message link could not be parsed
    #[error("invalid message link: {0}")]
    InvalidLink(String),

    /// Conversation surface failed to send, edit or delete a message
    #[error("conversation error: {0}")]
    Conversation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable error code, used in logs and status summaries
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Fetch(e) => match e {
                FetchError::PermissionDenied(_) => "permission_denied",
                FetchError::MessageNotFound(_) => "message_not_found",
                FetchError::NoMedia(_) => "no_media",
                FetchError::EmptySource => "empty_source",
                _ => "fetch_error",
            },
            Error::Store(e) => match e {
                StoreError::Rejected(StoreRejection::AuthExpired(_)) => "auth_expired",
                StoreError::Rejected(StoreRejection::QuotaExceeded(_)) => "quota_exceeded",
                StoreError::Rejected(StoreRejection::PathConflict(_)) => "path_conflict",
                StoreError::Rejected(StoreRejection::InvalidRequest(_)) => "store_rejected",
                _ => "chunk_send_error",
            },
            Error::Job(e) => match e {
                JobError::NotFound { .. } => "job_not_found",
                JobError::GroupNotFound { .. } => "group_not_found",
                JobError::InvalidTransition { .. } => "invalid_transition",
                JobError::AlreadyTerminal { .. } => "already_terminal",
            },
            Error::InvalidLink(_) => "invalid_link",
            Error::Conversation(_) => "conversation_error",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Message suitable for showing to the user in a status summary
    ///
    /// Store rejections carry an actionable hint; everything else uses the display text.
    pub fn user_message(&self) -> String {
        match self {
            Error::Store(StoreError::Rejected(rejection)) => rejection.user_message(),
            other => other.to_string(),
        }
    }
}

/// Source read failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transport-level read failure (connection dropped, chat RPC error)
    #[error("read failed: {0}")]
    Read(String),

    /// A chunk read did not complete within the configured timeout
    #[error("timed out waiting for source data")]
    Timeout,

    /// HTTP source answered with a non-success status
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The relay's session may not read this content
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Referenced message does not exist (deleted or never existed)
    #[error("message not found: {0}")]
    MessageNotFound(String),

    /// Referenced message carries nothing that can be transferred
    #[error("message has no media: {0}")]
    NoMedia(String),

    /// Requested message ids lie beyond the newest message of the channel
    #[error("reached the end of the channel")]
    ChannelEnd,

    /// Source ended before yielding a single byte
    #[error("source is empty")]
    EmptySource,
}

/// Destination store failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Transient failure sending a chunk or talking to the store (timeouts, 5xx, throttling)
    #[error("chunk send failed: {0}")]
    ChunkSend(String),

    /// A store operation did not complete within the configured timeout
    #[error("store operation timed out")]
    Timeout,

    /// Terminal rejection that retrying cannot fix
    #[error("store rejected request: {0}")]
    Rejected(StoreRejection),

    /// Upload session expired or is unknown to the store
    #[error("upload session expired or not found")]
    SessionLost,

    /// The store answered with something the client could not interpret
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

/// Terminal store rejections, surfaced to the user
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreRejection {
    /// Access token expired or was revoked
    #[error("authorization expired: {0}")]
    AuthExpired(String),

    /// Destination drive is full
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// An item already exists at the destination path
    #[error("path conflict: {0}")]
    PathConflict(String),

    /// Request was malformed or refused for policy reasons
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreRejection {
    /// Actionable message for the status summary
    pub fn user_message(&self) -> String {
        match self {
            StoreRejection::AuthExpired(_) => {
                "authorization expired, sign in to the drive again and resend".to_string()
            }
            StoreRejection::QuotaExceeded(_) => {
                "drive quota exceeded, free up space and resend".to_string()
            }
            StoreRejection::PathConflict(path) => {
                format!("an item already exists at {path}, rename or remove it and resend")
            }
            StoreRejection::InvalidRequest(reason) => format!("drive refused the upload: {reason}"),
        }
    }
}

/// Job-related errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found in the queue or database
    #[error("job {id} not found")]
    NotFound {
        /// The job ID that was not found
        id: JobId,
    },

    /// Job group not found
    #[error("job group {id} not found")]
    GroupNotFound {
        /// The group ID that was not found
        id: GroupId,
    },

    /// State machine does not allow this transition
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The job ID
        id: JobId,
        /// Current state
        from: JobState,
        /// Requested state
        to: JobState,
    },

    /// Operation requires a job that has not finished yet
    #[error("job {id} is already {state}")]
    AlreadyTerminal {
        /// The job ID
        id: JobId,
        /// Terminal state the job is in
        state: JobState,
    },
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Stored value could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}
