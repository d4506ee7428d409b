//! Database layer for chat-relay
//!
//! Handles SQLite persistence for jobs, job groups and runtime state.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`groups`]: Job group admission and status message tracking
//! - [`jobs`]: Job records, progress and session tokens
//! - [`state`]: Runtime state (shutdown tracking, auto-delete flag)

use crate::range::RangeStop;
use crate::types::{MessageRef, Source};
use sqlx::{FromRow, sqlite::SqlitePool};

mod groups;
mod jobs;
mod migrations;
mod state;

/// New job group to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewGroup {
    /// Message that triggered the request
    pub trigger: MessageRef,
    /// Number of sources asked for
    pub requested: usize,
    /// Hard boundary that cut a range short
    pub boundary: Option<RangeStop>,
}

/// New job to be inserted alongside its group
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Position within the group
    pub position: usize,
    /// Where the bytes come from
    pub source: Source,
    /// Destination path in the store
    pub destination_path: String,
}

/// Job group record from database
#[derive(Debug, Clone, FromRow)]
pub struct GroupRow {
    /// Unique database ID
    pub id: i64,
    /// Chat of the triggering message
    pub trigger_chat: String,
    /// Triggering message id
    pub trigger_message_id: i64,
    /// Chat of the status message, once sent
    pub status_chat: Option<String>,
    /// Status message id, once sent
    pub status_message_id: Option<i64>,
    /// Number of sources asked for
    pub requested: i64,
    /// JSON-encoded range boundary
    pub boundary: Option<String>,
    /// Unix timestamp when the group was admitted
    pub created_at: i64,
}

impl GroupRow {
    /// Triggering message, if the stored chat reference still parses
    pub fn trigger(&self) -> Option<MessageRef> {
        let chat = self.trigger_chat.parse().ok()?;
        Some(MessageRef::new(chat, self.trigger_message_id as i32))
    }

    /// Status message, if one was sent
    pub fn status_message(&self) -> Option<MessageRef> {
        let chat = self.status_chat.as_deref()?.parse().ok()?;
        Some(MessageRef::new(chat, self.status_message_id? as i32))
    }

    /// Decoded range boundary
    pub fn boundary(&self) -> Option<RangeStop> {
        serde_json::from_str(self.boundary.as_deref()?).ok()
    }
}

/// Job record from database
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// Unique database ID
    pub id: i64,
    /// Owning group
    pub group_id: i64,
    /// Position within the group
    pub position: i64,
    /// JSON-encoded [`Source`]
    pub source: String,
    /// Destination path in the store
    pub destination_path: String,
    /// State code (see [`crate::types::JobState::to_i32`])
    pub state: i32,
    /// Total size when known
    pub bytes_total: Option<i64>,
    /// Bytes committed to the store
    pub bytes_transferred: i64,
    /// Open upload session
    pub upload_session_token: Option<String>,
    /// Last failure reason
    pub error: Option<String>,
    /// Chunk-send retries in the current session
    pub attempt_count: i64,
    /// Stored object id
    pub object_id: Option<String>,
    /// Stored object path
    pub object_path: Option<String>,
    /// Stored object size
    pub object_size: Option<i64>,
    /// Unix timestamp when the job was admitted
    pub created_at: i64,
}

/// Database handle for chat-relay
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
