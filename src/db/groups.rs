//! Job group admission and status message tracking.

use crate::error::DatabaseError;
use crate::types::{GroupId, JobId, JobState, MessageRef};
use crate::{Error, Result};

use super::{Database, GroupRow, NewGroup, NewJob};

const GROUP_COLUMNS: &str = r#"
    id, trigger_chat, trigger_message_id, status_chat, status_message_id,
    requested, boundary, created_at
"#;

impl Database {
    /// Insert a group and its jobs atomically
    ///
    /// Either every job is admitted or none is. Job ids are returned in `jobs` order.
    pub async fn insert_group_with_jobs(
        &self,
        group: &NewGroup,
        jobs: &[NewJob],
    ) -> Result<(GroupId, Vec<JobId>)> {
        let now = chrono::Utc::now().timestamp();
        let boundary = group
            .boundary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin admission transaction: {}",
                e
            )))
        })?;

        let result = sqlx::query(
            r#"
            INSERT INTO job_groups (trigger_chat, trigger_message_id, requested, boundary, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(group.trigger.chat.to_string())
        .bind(group.trigger.message_id)
        .bind(group.requested as i64)
        .bind(boundary)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert job group: {}",
                e
            )))
        })?;
        let group_id = GroupId(result.last_insert_rowid());

        let mut job_ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let source = serde_json::to_string(&job.source)?;
            let result = sqlx::query(
                r#"
                INSERT INTO jobs (group_id, position, source, destination_path, state, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(group_id)
            .bind(job.position as i64)
            .bind(source)
            .bind(&job.destination_path)
            .bind(JobState::Queued.to_i32())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to insert job: {}",
                    e
                )))
            })?;
            job_ids.push(JobId(result.last_insert_rowid()));
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit admission: {}",
                e
            )))
        })?;

        Ok((group_id, job_ids))
    }

    /// Get a job group by ID
    pub async fn get_group(&self, id: GroupId) -> Result<Option<GroupRow>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            "SELECT {GROUP_COLUMNS} FROM job_groups WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get job group: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Most recent group started by `trigger`
    pub async fn find_group_by_trigger(&self, trigger: &MessageRef) -> Result<Option<GroupRow>> {
        let row = sqlx::query_as::<_, GroupRow>(&format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM job_groups
            WHERE trigger_chat = ? AND trigger_message_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(trigger.chat.to_string())
        .bind(trigger.message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to find job group by trigger: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Remember the status message that reports on a group
    pub async fn set_status_message(&self, id: GroupId, status: &MessageRef) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_groups SET status_chat = ?, status_message_id = ? WHERE id = ?
            "#,
        )
        .bind(status.chat.to_string())
        .bind(status.message_id)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to set status message: {}",
                e
            )))
        })?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "job group {}",
                id
            ))));
        }

        Ok(())
    }

    /// Mark a group finished, returning true only for the first caller
    pub async fn claim_group_finished(&self, id: GroupId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_groups SET finished_at = ? WHERE id = ? AND finished_at IS NULL
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to mark job group finished: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() == 1)
    }
}
