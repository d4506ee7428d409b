//! Core types for chat-relay

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::range::RangeStop;

// Integer newtype ids stored as sqlite INTEGER columns
macro_rules! sqlite_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

sqlite_id!(
    /// Unique identifier for a job, assigned at admission
    JobId
);

sqlite_id!(
    /// Unique identifier for a job group (one status message)
    GroupId
);

/// Reference to a chat: numeric id or public username
///
/// Renders as the bare id or `@username`, which is also its stored form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ChatRef {
    /// Numeric chat id (private channels, groups, users)
    Id(i64),
    /// Public username without the leading `@`
    Username(String),
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{id}"),
            ChatRef::Username(name) => write!(f, "@{name}"),
        }
    }
}

impl FromStr for ChatRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix('@') {
            if name.is_empty() {
                return Err("empty username".to_string());
            }
            return Ok(ChatRef::Username(name.to_string()));
        }
        s.parse::<i64>()
            .map(ChatRef::Id)
            .map_err(|e| format!("invalid chat reference '{s}': {e}"))
    }
}

impl From<ChatRef> for String {
    fn from(chat: ChatRef) -> Self {
        chat.to_string()
    }
}

impl TryFrom<String> for ChatRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single message within a chat
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    /// Chat the message lives in
    pub chat: ChatRef,
    /// Message id within the chat
    pub message_id: i32,
}

impl MessageRef {
    /// Create a new message reference
    pub fn new(chat: ChatRef, message_id: i32) -> Self {
        Self { chat, message_id }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chat, self.message_id)
    }
}

/// Where a job's bytes come from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// Media uploaded directly in the conversation
    ChatMedia {
        /// Message carrying the media
        message: MessageRef,
    },
    /// Media forwarded into the conversation from elsewhere
    ForwardedMedia {
        /// The forwarded message as seen in the conversation
        message: MessageRef,
    },
    /// Message in a channel the relay's user session can read but the bot cannot
    RestrictedLink {
        /// Channel holding the message
        channel: ChatRef,
        /// Message id within the channel
        message_id: i32,
    },
    /// Remote HTTP(S) URL
    RemoteUrl {
        /// Absolute URL
        url: String,
    },
}

impl Source {
    /// Short name of the source kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Source::ChatMedia { .. } => "chat_media",
            Source::ForwardedMedia { .. } => "forwarded_media",
            Source::RestrictedLink { .. } => "restricted_link",
            Source::RemoteUrl { .. } => "remote_url",
        }
    }

    /// Message in the conversation that carried this source, if any
    ///
    /// This is the message auto-delete removes after success.
    pub fn origin_message(&self) -> Option<&MessageRef> {
        match self {
            Source::ChatMedia { message } | Source::ForwardedMedia { message } => Some(message),
            Source::RestrictedLink { .. } | Source::RemoteUrl { .. } => None,
        }
    }

    /// Message the content proxy reads bytes from, if the source is a chat message
    pub fn media_message(&self) -> Option<MessageRef> {
        match self {
            Source::ChatMedia { message } | Source::ForwardedMedia { message } => {
                Some(message.clone())
            }
            Source::RestrictedLink {
                channel,
                message_id,
            } => Some(MessageRef::new(channel.clone(), *message_id)),
            Source::RemoteUrl { .. } => None,
        }
    }
}

/// Job state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Admitted, waiting for a worker
    Queued,
    /// Worker assigned, opening or reading the source
    Fetching,
    /// At least one chunk read; chunks are being sent
    Uploading,
    /// Source exhausted, waiting for the store to confirm
    Finalizing,
    /// Store confirmed the object
    Succeeded,
    /// Non-retriable error or retry budget exhausted
    Failed,
    /// Canceled at a chunk boundary
    Canceled,
}

impl JobState {
    /// Convert integer state code to JobState
    pub fn from_i32(state: i32) -> Self {
        match state {
            0 => JobState::Queued,
            1 => JobState::Fetching,
            2 => JobState::Uploading,
            3 => JobState::Finalizing,
            4 => JobState::Succeeded,
            5 => JobState::Failed,
            6 => JobState::Canceled,
            _ => JobState::Failed, // Unknown codes are treated as failed
        }
    }

    /// Convert JobState to integer state code
    pub fn to_i32(&self) -> i32 {
        match self {
            JobState::Queued => 0,
            JobState::Fetching => 1,
            JobState::Uploading => 2,
            JobState::Finalizing => 3,
            JobState::Succeeded => 4,
            JobState::Failed => 5,
            JobState::Canceled => 6,
        }
    }

    /// Whether the job can never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    /// Whether a worker currently owns the job
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Fetching | JobState::Uploading | JobState::Finalizing
        )
    }

    /// State machine edges
    ///
    /// Active states may fall back to `Fetching` or `Uploading` on a resumed retry, and to
    /// `Queued` when a restart re-admits them. `Uploading` requires a chunk to have been
    /// read, so `Fetching -> Finalizing` is only taken by store-side URL fetches.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Fetching | Failed | Canceled) => true,
            (Fetching, Fetching | Uploading | Finalizing | Failed | Canceled | Queued) => true,
            (Uploading, Fetching | Uploading | Finalizing | Failed | Canceled | Queued) => true,
            (Finalizing, Succeeded | Failed | Uploading | Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Fetching => "fetching",
            JobState::Uploading => "uploading",
            JobState::Finalizing => "finalizing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Aggregate state of a job group
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupState {
    /// At least one member has not finished and none has failed
    Running,
    /// Every member succeeded
    Succeeded,
    /// At least one member failed; siblings keep their results
    Failed,
    /// All members finished, none failed, at least one was canceled
    Canceled,
}

impl GroupState {
    /// Fold member states into the group state
    ///
    /// An empty group has nothing outstanding and counts as succeeded.
    pub fn aggregate<'a>(states: impl IntoIterator<Item = &'a JobState>) -> Self {
        let mut any_running = false;
        let mut any_failed = false;
        let mut any_canceled = false;
        for state in states {
            match state {
                JobState::Failed => any_failed = true,
                JobState::Canceled => any_canceled = true,
                JobState::Succeeded => {}
                _ => any_running = true,
            }
        }
        if any_failed {
            GroupState::Failed
        } else if any_running {
            GroupState::Running
        } else if any_canceled {
            GroupState::Canceled
        } else {
            GroupState::Succeeded
        }
    }
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupState::Running => "running",
            GroupState::Succeeded => "succeeded",
            GroupState::Failed => "failed",
            GroupState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Finalized object in the destination store
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Store-assigned item id
    pub id: String,
    /// Full path of the item in the store
    pub path: String,
    /// Object size in bytes
    pub size: u64,
}

/// Event emitted during the job lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job admitted
    Queued {
        /// Job ID
        id: JobId,
        /// Owning group
        group: GroupId,
        /// Destination path in the store
        destination: String,
    },

    /// Worker assigned, reading the source
    Fetching {
        /// Job ID
        id: JobId,
    },

    /// Chunk committed to the store
    Uploading {
        /// Job ID
        id: JobId,
        /// Bytes committed so far
        bytes_transferred: u64,
        /// Total size when known
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
    },

    /// Source exhausted, waiting for the store
    Finalizing {
        /// Job ID
        id: JobId,
    },

    /// Object stored
    Succeeded {
        /// Job ID
        id: JobId,
        /// Stored object
        object: ObjectDescriptor,
    },

    /// Job failed
    Failed {
        /// Job ID
        id: JobId,
        /// Error message
        error: String,
    },

    /// Job canceled
    Canceled {
        /// Job ID
        id: JobId,
    },

    /// Queued job could not be re-admitted after a restart
    Dropped {
        /// Job ID
        id: JobId,
        /// Why it was dropped
        reason: String,
    },

    /// Every member of a group reached a terminal state
    GroupFinished {
        /// Group ID
        group: GroupId,
        /// Aggregate state
        state: GroupState,
        /// Members that succeeded
        succeeded: usize,
        /// Total members
        total: usize,
    },

    /// Auto-delete toggled
    AutoDeleteChanged {
        /// New value
        enabled: bool,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Inbound request from the conversation surface
///
/// The closed set of commands the relay understands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Transfer one or more sources as a single group
    Transfer {
        /// Message that triggered the request; the status message replies to it
        trigger: MessageRef,
        /// Sources in display order
        sources: Vec<Source>,
        /// Sub-directory under the destination root
        #[serde(default)]
        directory: Option<String>,
    },
    /// Transfer the message a link points to
    Link {
        /// Message that triggered the request
        trigger: MessageRef,
        /// `https://t.me/...` message link
        link: String,
        /// Sub-directory under the destination root
        #[serde(default)]
        directory: Option<String>,
    },
    /// Transfer `count` consecutive messages starting at `start`
    Range {
        /// Message that triggered the request
        trigger: MessageRef,
        /// First message of the range
        start: MessageRef,
        /// Number of message ids to cover
        count: usize,
        /// Sub-directory under the destination root
        #[serde(default)]
        directory: Option<String>,
    },
    /// Cancel one job
    Cancel {
        /// Job to cancel
        job: JobId,
    },
    /// Cancel every queued and active job
    CancelAll,
    /// Flip the auto-delete flag
    ToggleAutoDelete,
    /// Find the status message for a triggering message
    Locate {
        /// Triggering message
        trigger: MessageRef,
    },
}

/// What handling a [`Request`] produced
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// Jobs admitted as one group
    Admitted {
        /// Group holding the jobs
        group: GroupId,
        /// Admitted jobs in order
        jobs: Vec<JobId>,
        /// Sources asked for; exceeds `jobs.len()` when a range came up short
        requested: usize,
        /// Hard boundary that stopped a range early
        #[serde(skip_serializing_if = "Option::is_none")]
        boundary: Option<RangeStop>,
    },
    /// Jobs canceled
    Canceled {
        /// Jobs that were canceled
        jobs: Vec<JobId>,
    },
    /// New auto-delete value
    AutoDelete {
        /// Whether auto-delete is now on
        enabled: bool,
    },
    /// Status message for a trigger, if one exists
    Located {
        /// Status message
        status: Option<MessageRef>,
    },
}
