//! Job record persistence.

use crate::error::DatabaseError;
use crate::job::Job;
use crate::types::{GroupId, JobId, JobState};
use crate::{Error, Result};

use super::{Database, JobRow};

const JOB_COLUMNS: &str = r#"
    id, group_id, position, source, destination_path, state,
    bytes_total, bytes_transferred, upload_session_token, error, attempt_count,
    object_id, object_path, object_size, created_at
"#;

impl Database {
    /// Get a job by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get job: {}",
                    e
                )))
            })?;

        Ok(row)
    }

    /// Jobs of a group in display order
    pub async fn list_group_jobs(&self, group: GroupId) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE group_id = ? ORDER BY position ASC"
        ))
        .bind(group)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list group jobs: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Jobs not yet in a terminal state, in admission order
    pub async fn list_unfinished_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state IN (?, ?, ?, ?)
            ORDER BY id ASC
            "#
        ))
        .bind(JobState::Queued.to_i32())
        .bind(JobState::Fetching.to_i32())
        .bind(JobState::Uploading.to_i32())
        .bind(JobState::Finalizing.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list unfinished jobs: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Persist the mutable part of a job
    ///
    /// `bytes_transferred` is stored as the maximum of the old and new values.
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let state = job.state();
        let started_at = state.is_active().then_some(now);
        let completed_at = state.is_terminal().then_some(now);
        let object = job.object();

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                state = ?,
                bytes_total = ?,
                bytes_transferred = MAX(bytes_transferred, ?),
                upload_session_token = ?,
                error = ?,
                attempt_count = ?,
                object_id = ?,
                object_path = ?,
                object_size = ?,
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(state.to_i32())
        .bind(job.bytes_total().map(|t| t as i64))
        .bind(job.bytes_transferred() as i64)
        .bind(job.session_token().map(|t| t.as_str()))
        .bind(job.error())
        .bind(job.attempt_count() as i64)
        .bind(object.map(|o| o.id.as_str()))
        .bind(object.map(|o| o.path.as_str()))
        .bind(object.map(|o| o.size as i64))
        .bind(started_at)
        .bind(completed_at)
        .bind(job.id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to save job: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "job {}",
                job.id
            ))));
        }

        Ok(())
    }

    /// Mark a job failed without loading it
    ///
    /// Used for rows that cannot be decoded into a [`Job`].
    pub async fn mark_job_dropped(&self, id: JobId, reason: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, error = ?, upload_session_token = NULL, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobState::Failed.to_i32())
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark job dropped: {}",
                e
            )))
        })?;

        Ok(())
    }
}
