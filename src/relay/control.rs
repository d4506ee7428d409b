//! Job control: cancellation, the auto-delete flag and job inspection.

use std::sync::atomic::Ordering;

use crate::error::{JobError, Result};
use crate::job::{Job, JobSnapshot};
use crate::types::{Event, GroupId, JobId};

use super::Relay;

impl Relay {
    /// Cancel a job
    ///
    /// A queued job is canceled immediately. An active job is signaled and stops at its
    /// next chunk boundary; the chunk being sent completes first, then the upload session
    /// is discarded so no partial object remains. Either way the job ends `Canceled`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The job doesn't exist
    /// - The job already reached a terminal state
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use chat_relay::*;
    /// # async fn example(relay: Relay, id: JobId) -> Result<()> {
    /// relay.cancel(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        {
            let mut queue = self.queue_state.queue.lock().await;
            if let Some(index) = queue.iter().position(|queued| *queued == id) {
                queue.remove(index);
                drop(queue);
                return self.cancel_queued(id).await;
            }

            // Lock order: queue, then active jobs (same as the queue processor)
            let active = self.queue_state.active_jobs.lock().await;
            if let Some(token) = active.get(&id) {
                tracing::info!(job_id = id.0, "cancellation requested");
                token.cancel();
                return Ok(());
            }
        }

        // Not in memory: either finished or never dispatched
        self.cancel_queued(id).await
    }

    /// Cancel every queued and active job
    ///
    /// Returns the jobs that were signaled, queued ones first.
    pub async fn cancel_all(&self) -> Vec<JobId> {
        let (queued, active): (Vec<JobId>, Vec<JobId>) = {
            let mut queue = self.queue_state.queue.lock().await;
            let queued: Vec<JobId> = queue.drain(..).collect();
            let active = self.queue_state.active_jobs.lock().await;
            for token in active.values() {
                token.cancel();
            }
            (queued, active.keys().copied().collect())
        };

        tracing::info!(
            queued = queued.len(),
            active = active.len(),
            "canceling all jobs"
        );

        for id in &queued {
            if let Err(e) = self.cancel_queued(*id).await {
                tracing::warn!(job_id = id.0, error = %e, "failed to cancel queued job");
            }
        }

        queued.into_iter().chain(active).collect()
    }

    async fn cancel_queued(&self, id: JobId) -> Result<()> {
        let row = self
            .db
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })?;
        let mut job = Job::try_from(row)?;

        // A job restored after a restart may still hold its session
        if let Some(token) = job.take_session() {
            self.pipeline.sessions.abort(&token).await;
        }
        job.cancel()?;
        self.db.save_job(&job).await?;

        tracing::info!(job_id = id.0, "queued job canceled");
        self.emit_event(Event::Canceled { id });
        self.pipeline
            .reporter
            .update(job.group_id, job.snapshot())
            .await;
        self.complete_group_if_finished(job.group_id).await;
        Ok(())
    }

    /// Whether succeeded jobs delete their originating message
    pub fn auto_delete(&self) -> bool {
        self.runtime_config.auto_delete.load(Ordering::SeqCst)
    }

    /// Set the auto-delete flag and persist it
    pub async fn set_auto_delete(&self, enabled: bool) -> Result<()> {
        self.runtime_config
            .auto_delete
            .store(enabled, Ordering::SeqCst);
        self.db.set_auto_delete(enabled).await?;
        tracing::info!(enabled, "auto-delete changed");
        self.emit_event(Event::AutoDeleteChanged { enabled });
        Ok(())
    }

    /// Flip the auto-delete flag, returning the new value
    pub async fn toggle_auto_delete(&self) -> Result<bool> {
        let enabled = !self
            .runtime_config
            .auto_delete
            .fetch_xor(true, Ordering::SeqCst);
        self.db.set_auto_delete(enabled).await?;
        tracing::info!(enabled, "auto-delete toggled");
        self.emit_event(Event::AutoDeleteChanged { enabled });
        Ok(enabled)
    }

    /// Current view of one job
    pub async fn job(&self, id: JobId) -> Result<Option<JobSnapshot>> {
        let row = self.db.get_job(id).await?;
        Ok(row.as_ref().map(JobSnapshot::from))
    }

    /// Current view of a group's members in display order
    pub async fn group_snapshots(&self, group: GroupId) -> Result<Vec<JobSnapshot>> {
        let rows = self.db.list_group_jobs(group).await?;
        Ok(rows.iter().map(JobSnapshot::from).collect())
    }

    /// Jobs a worker currently owns
    pub async fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .queue_state
            .active_jobs
            .lock()
            .await
            .keys()
            .copied()
            .collect();
        ids.sort_by_key(|id| id.0);
        ids
    }
}
