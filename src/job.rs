//! Job record and its state machine
//!
//! A [`Job`] binds one [`Source`] to one destination path. Fields that carry invariants are
//! private and only change through methods:
//! - `state` moves along [`JobState::can_transition_to`] edges; terminal states are final
//! - `bytes_transferred` never decreases
//! - the upload session token is stable until explicitly replaced

use crate::db::JobRow;
use crate::error::{DatabaseError, Error, JobError};
use crate::store::UploadSessionToken;
use crate::types::{GroupId, JobId, JobState, ObjectDescriptor, Source};

/// One transfer from a source to a destination path
#[derive(Clone, Debug)]
pub struct Job {
    /// Assigned at admission
    pub id: JobId,
    /// Group the job belongs to
    pub group_id: GroupId,
    /// Position within the group (display order)
    pub position: usize,
    /// Where the bytes come from
    pub source: Source,
    /// Destination path in the store
    pub destination_path: String,
    state: JobState,
    bytes_total: Option<u64>,
    bytes_transferred: u64,
    upload_session_token: Option<UploadSessionToken>,
    error: Option<String>,
    attempt_count: u32,
    object: Option<ObjectDescriptor>,
}

/// Read-only view of a job for rendering
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSnapshot {
    /// Job ID
    pub id: JobId,
    /// Position within the group
    pub position: usize,
    /// Display label (destination filename)
    pub label: String,
    /// Current state
    pub state: JobState,
    /// Total size when known
    pub bytes_total: Option<u64>,
    /// Bytes committed to the store
    pub bytes_transferred: u64,
    /// Last failure reason
    pub error: Option<String>,
}

impl JobSnapshot {
    /// Whole percentage when the total is known
    pub fn percent(&self) -> Option<u8> {
        let total = self.bytes_total?;
        if total == 0 {
            return Some(100);
        }
        let pct = self.bytes_transferred.min(total) as f64 / total as f64 * 100.0;
        Some(pct.floor() as u8)
    }
}

impl Job {
    /// A freshly admitted job
    pub fn new(
        id: JobId,
        group_id: GroupId,
        position: usize,
        source: Source,
        destination_path: String,
    ) -> Self {
        Self {
            id,
            group_id,
            position,
            source,
            destination_path,
            state: JobState::Queued,
            bytes_total: None,
            bytes_transferred: 0,
            upload_session_token: None,
            error: None,
            attempt_count: 0,
            object: None,
        }
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Total size, once the source declared it
    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    /// Bytes the store has committed
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Current upload session, if one was opened
    pub fn session_token(&self) -> Option<&UploadSessionToken> {
        self.upload_session_token.as_ref()
    }

    /// Last failure reason
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Chunk-send retries in the current session
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Stored object after success
    pub fn object(&self) -> Option<&ObjectDescriptor> {
        self.object.as_ref()
    }

    /// Move to `next`, rejecting edges the state machine does not have
    pub fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if self.state.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: self.id,
                state: self.state,
            });
        }
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Record the source's declared size
    ///
    /// A known total is never replaced by an unknown one.
    pub fn set_bytes_total(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.bytes_total = total;
        }
    }

    /// Advance the committed byte count; lower values are ignored
    ///
    /// Returns whether the count moved.
    pub fn record_progress(&mut self, committed: u64) -> bool {
        if committed > self.bytes_transferred {
            self.bytes_transferred = committed;
            true
        } else {
            false
        }
    }

    /// Attach an upload session, returning the one it replaces
    ///
    /// Replacing a session starts a fresh retry budget.
    pub fn issue_session(&mut self, token: UploadSessionToken) -> Option<UploadSessionToken> {
        let previous = self.upload_session_token.replace(token);
        if previous.is_some() {
            self.attempt_count = 0;
        }
        previous
    }

    /// Forget the session, returning it
    pub fn take_session(&mut self) -> Option<UploadSessionToken> {
        self.upload_session_token.take()
    }

    /// Count one chunk-send retry
    pub fn record_retry(&mut self, reason: impl Into<String>) {
        self.attempt_count += 1;
        self.error = Some(reason.into());
    }

    /// Mark the job succeeded with the stored object
    pub fn succeed(&mut self, object: ObjectDescriptor) -> Result<(), JobError> {
        self.transition(JobState::Succeeded)?;
        self.bytes_transferred = self.bytes_transferred.max(object.size);
        self.bytes_total = Some(object.size);
        self.upload_session_token = None;
        self.error = None;
        self.object = Some(object);
        Ok(())
    }

    /// Mark the job failed, keeping `reason` for display
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Mark the job canceled
    pub fn cancel(&mut self) -> Result<(), JobError> {
        self.transition(JobState::Canceled)?;
        self.upload_session_token = None;
        Ok(())
    }

    /// Put an interrupted job back in the queue after a restart
    ///
    /// Progress and the session token are kept so the transfer resumes.
    pub fn requeue(&mut self) -> Result<(), JobError> {
        if self.state == JobState::Queued {
            return Ok(());
        }
        self.transition(JobState::Queued)
    }

    /// Filename part of the destination path
    pub fn label(&self) -> &str {
        label_of(&self.destination_path)
    }

    /// Render-ready view
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            position: self.position,
            label: self.label().to_string(),
            state: self.state,
            bytes_total: self.bytes_total,
            bytes_transferred: self.bytes_transferred,
            error: self.error.clone(),
        }
    }
}

fn label_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// Rows whose source no longer decodes still render in their group's summary
impl From<&JobRow> for JobSnapshot {
    fn from(row: &JobRow) -> Self {
        Self {
            id: JobId(row.id),
            position: row.position.max(0) as usize,
            label: label_of(&row.destination_path).to_string(),
            state: JobState::from_i32(row.state),
            bytes_total: row.bytes_total.map(|t| t.max(0) as u64),
            bytes_transferred: row.bytes_transferred.max(0) as u64,
            error: row.error.clone(),
        }
    }
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let source: Source = serde_json::from_str(&row.source).map_err(|e| {
            Error::Database(DatabaseError::Corrupt(format!(
                "job {} has an undecodable source: {}",
                row.id, e
            )))
        })?;

        let object = match (row.object_id, row.object_path) {
            (Some(id), Some(path)) => Some(ObjectDescriptor {
                id,
                path,
                size: row.object_size.unwrap_or(0).max(0) as u64,
            }),
            _ => None,
        };

        Ok(Self {
            id: JobId(row.id),
            group_id: GroupId(row.group_id),
            position: row.position.max(0) as usize,
            source,
            destination_path: row.destination_path,
            state: JobState::from_i32(row.state),
            bytes_total: row.bytes_total.map(|t| t.max(0) as u64),
            bytes_transferred: row.bytes_transferred.max(0) as u64,
            upload_session_token: row.upload_session_token.map(UploadSessionToken),
            error: row.error,
            attempt_count: row.attempt_count.max(0) as u32,
            object,
        })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatRef, MessageRef};

    fn job() -> Job {
        Job::new(
            JobId(1),
            GroupId(1),
            0,
            Source::ChatMedia {
                message: MessageRef::new(ChatRef::Id(10), 5),
            },
            "/Telegram/video.mp4".to_string(),
        )
    }

    fn object(size: u64) -> ObjectDescriptor {
        ObjectDescriptor {
            id: "X".into(),
            path: "/Telegram/video.mp4".into(),
            size,
        }
    }

    #[test]
    fn walks_the_happy_path() {
        let mut job = job();
        job.transition(JobState::Fetching).unwrap();
        job.transition(JobState::Uploading).unwrap();
        job.transition(JobState::Finalizing).unwrap();
        job.succeed(object(10)).unwrap();
        assert_eq!(job.state(), JobState::Succeeded);
        assert_eq!(job.bytes_transferred(), 10);
        assert!(job.session_token().is_none());
    }

    #[test]
    fn rejects_skipping_fetch() {
        let mut job = job();
        let err = job.transition(JobState::Uploading).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(job.state(), JobState::Queued);
    }

    #[test]
    fn terminal_jobs_refuse_changes() {
        let mut job = job();
        job.cancel().unwrap();
        let err = job.transition(JobState::Fetching).unwrap_err();
        assert!(matches!(
            err,
            JobError::AlreadyTerminal {
                state: JobState::Canceled,
                ..
            }
        ));
    }

    #[test]
    fn progress_never_goes_backwards() {
        let mut job = job();
        assert!(job.record_progress(100));
        assert!(!job.record_progress(50));
        assert_eq!(job.bytes_transferred(), 100);
        assert!(job.record_progress(200));
        assert_eq!(job.bytes_transferred(), 200);
    }

    #[test]
    fn replacing_session_resets_attempts() {
        let mut job = job();
        assert!(job.issue_session(UploadSessionToken("a".into())).is_none());
        job.record_retry("reset");
        job.record_retry("reset");
        assert_eq!(job.attempt_count(), 2);

        let previous = job.issue_session(UploadSessionToken("b".into()));
        assert_eq!(previous, Some(UploadSessionToken("a".into())));
        assert_eq!(job.attempt_count(), 0);
        assert_eq!(job.session_token().unwrap().as_str(), "b");
    }

    #[test]
    fn failure_keeps_reason() {
        let mut job = job();
        job.transition(JobState::Fetching).unwrap();
        job.fail("quota exceeded").unwrap();
        assert_eq!(job.error(), Some("quota exceeded"));
    }

    #[test]
    fn finalizing_cannot_be_canceled() {
        let mut job = job();
        job.transition(JobState::Fetching).unwrap();
        job.transition(JobState::Uploading).unwrap();
        job.transition(JobState::Finalizing).unwrap();
        assert!(job.cancel().is_err());
    }

    #[test]
    fn requeue_keeps_progress_and_token() {
        let mut job = job();
        job.transition(JobState::Fetching).unwrap();
        job.transition(JobState::Uploading).unwrap();
        job.issue_session(UploadSessionToken("tok".into()));
        job.record_progress(40);
        job.requeue().unwrap();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.bytes_transferred(), 40);
        assert!(job.session_token().is_some());
    }

    #[test]
    fn snapshot_percent() {
        let mut job = job();
        assert_eq!(job.snapshot().percent(), None);
        job.set_bytes_total(Some(200));
        job.record_progress(50);
        let snapshot = job.snapshot();
        assert_eq!(snapshot.percent(), Some(25));
        assert_eq!(snapshot.label, "video.mp4");

        job.set_bytes_total(None);
        assert_eq!(job.bytes_total(), Some(200));
    }

    #[test]
    fn decodes_from_row() {
        let row = JobRow {
            id: 4,
            group_id: 2,
            position: 1,
            source: r#"{"kind":"remote_url","url":"https://example.com/a.zip"}"#.into(),
            destination_path: "/Telegram/a.zip".into(),
            state: JobState::Uploading.to_i32(),
            bytes_total: Some(100),
            bytes_transferred: 60,
            upload_session_token: Some("https://upload/1".into()),
            error: None,
            attempt_count: 1,
            object_id: None,
            object_path: None,
            object_size: None,
            created_at: 0,
        };
        let job = Job::try_from(row).unwrap();
        assert_eq!(job.id, JobId(4));
        assert_eq!(job.state(), JobState::Uploading);
        assert_eq!(job.bytes_transferred(), 60);
        assert_eq!(job.session_token().unwrap().as_str(), "https://upload/1");
    }

    #[test]
    fn corrupt_source_is_reported() {
        let row = JobRow {
            id: 4,
            group_id: 2,
            position: 0,
            source: "{not json".into(),
            destination_path: "/x".into(),
            state: 0,
            bytes_total: None,
            bytes_transferred: 0,
            upload_session_token: None,
            error: None,
            attempt_count: 0,
            object_id: None,
            object_path: None,
            object_size: None,
            created_at: 0,
        };
        let err = Job::try_from(row).unwrap_err();
        assert!(matches!(err, Error::Database(DatabaseError::Corrupt(_))));
    }
}
