//! Job task context: shared state and the persist/emit/report helpers every phase uses.

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, JobError};
use crate::job::Job;
use crate::types::{Event, JobId, JobState, ObjectDescriptor};

use super::super::Relay;

/// How a transfer attempt ended
#[derive(Debug)]
pub(super) enum TransferOutcome {
    /// The store confirmed the object
    Stored(ObjectDescriptor),
    /// The job was canceled at a chunk boundary
    Canceled,
    /// Shutdown stopped the job; it resumes on the next start
    Interrupted,
    /// Non-retriable error or retry budget exhausted
    Failed(Error),
}

/// Shared context for a single job task, reducing parameter passing between helpers.
pub(crate) struct JobTaskContext {
    pub(crate) id: JobId,
    pub(crate) relay: Relay,
    pub(crate) cancel_token: CancellationToken,
}

impl JobTaskContext {
    pub(super) fn config(&self) -> &Config {
        &self.relay.config
    }

    /// Remove this job from the active jobs map.
    pub(super) async fn remove_from_active(&self) {
        let mut active = self.relay.queue_state.active_jobs.lock().await;
        active.remove(&self.id);
    }

    /// Outcome for an observed cancellation: shutdown interrupts, anything else cancels
    pub(super) fn cancel_outcome(&self) -> TransferOutcome {
        if self.relay.queue_state.shutdown.is_cancelled() {
            TransferOutcome::Interrupted
        } else {
            TransferOutcome::Canceled
        }
    }

    /// Write the job record; failures are logged, the transfer carries on
    pub(super) async fn persist(&self, job: &Job) {
        if let Err(e) = self.relay.db.save_job(job).await {
            tracing::error!(job_id = self.id.0, error = %e, "failed to persist job");
        }
    }

    /// Push the job's snapshot to its group's status message
    pub(super) async fn report(&self, job: &Job) {
        self.relay
            .pipeline
            .reporter
            .update(job.group_id, job.snapshot())
            .await;
    }

    /// Move the job to `next`, then persist, emit and report it
    pub(super) async fn advance(&self, job: &mut Job, next: JobState) -> Result<(), JobError> {
        job.transition(next)?;
        self.persist(job).await;
        match next {
            JobState::Fetching => self.relay.emit_event(Event::Fetching { id: job.id }),
            JobState::Uploading => self.relay.emit_event(Event::Uploading {
                id: job.id,
                bytes_transferred: job.bytes_transferred(),
                bytes_total: job.bytes_total(),
            }),
            JobState::Finalizing => self.relay.emit_event(Event::Finalizing { id: job.id }),
            _ => {}
        }
        self.report(job).await;
        Ok(())
    }

    /// Record committed bytes; persists, emits and reports only when the count moved
    pub(super) async fn progress(&self, job: &mut Job, committed: u64) {
        if !job.record_progress(committed) {
            return;
        }
        self.persist(job).await;
        self.relay.emit_event(Event::Uploading {
            id: job.id,
            bytes_transferred: job.bytes_transferred(),
            bytes_total: job.bytes_total(),
        });
        self.report(job).await;
    }
}
