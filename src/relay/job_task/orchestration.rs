//! Job task orchestration: top-level lifecycle for a single job.

use crate::job::Job;
use crate::types::{Event, JobState, Source};

use super::context::{JobTaskContext, TransferOutcome};
use super::{remote_url, upload};

/// Core job task -- owns one job from dispatch until it is terminal.
///
/// Phases:
/// 1. Load the job record and skip jobs that finished while queued
/// 2. Transition to Fetching
/// 3. Let the store fetch remote URLs itself, when enabled
/// 4. Otherwise stream the source through the upload session
/// 5. Record the outcome, then announce the group if this was its last member
pub(crate) async fn run_job_task(ctx: JobTaskContext) {
    let id = ctx.id;

    // Phase 1: Load the job record
    let Some(mut job) = load_job(&ctx).await else {
        ctx.remove_from_active().await;
        return;
    };

    if ctx.cancel_token.is_cancelled() {
        let outcome = ctx.cancel_outcome();
        finish(&ctx, job, outcome).await;
        return;
    }

    // Phase 2: Worker assigned
    if let Err(e) = ctx.advance(&mut job, JobState::Fetching).await {
        tracing::error!(job_id = id.0, error = %e, "job cannot start");
        ctx.remove_from_active().await;
        return;
    }

    tracing::info!(
        job_id = id.0,
        group_id = job.group_id.0,
        source = job.source.kind(),
        resume_offset = job.bytes_transferred(),
        "job started"
    );

    // Phase 3: Store-side URL fetch; a job with a session already streamed some bytes
    let mut outcome = None;
    if let Source::RemoteUrl { url } = job.source.clone()
        && ctx.config().transfer.delegate_url_fetch
        && job.session_token().is_none()
    {
        outcome = remote_url::delegate(&ctx, &mut job, &url).await;
    }

    // Phase 4: Stream through the upload session
    let outcome = match outcome {
        Some(outcome) => outcome,
        None => upload::stream_to_store(&ctx, &mut job).await,
    };

    // Phase 5: Record the outcome
    finish(&ctx, job, outcome).await;
}

async fn load_job(ctx: &JobTaskContext) -> Option<Job> {
    let row = match ctx.relay.db.get_job(ctx.id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            tracing::warn!(job_id = ctx.id.0, "job vanished before it started");
            return None;
        }
        Err(e) => {
            tracing::error!(job_id = ctx.id.0, error = %e, "failed to load job");
            return None;
        }
    };

    match Job::try_from(row) {
        Ok(job) if job.state().is_terminal() => {
            tracing::debug!(job_id = ctx.id.0, state = %job.state(), "job already finished");
            None
        }
        Ok(job) => Some(job),
        Err(e) => {
            let reason = format!("dropped: {e}");
            tracing::error!(job_id = ctx.id.0, error = %e, "job record cannot be decoded");
            if let Err(e) = ctx.relay.db.mark_job_dropped(ctx.id, &reason).await {
                tracing::error!(job_id = ctx.id.0, error = %e, "failed to mark job dropped");
            }
            ctx.relay.emit_event(Event::Dropped { id: ctx.id, reason });
            None
        }
    }
}

/// Apply the outcome to the job, persist it and release the worker slot
async fn finish(ctx: &JobTaskContext, mut job: Job, outcome: TransferOutcome) {
    let id = job.id;
    let sessions = &ctx.relay.pipeline.sessions;

    match outcome {
        TransferOutcome::Stored(object) => {
            let result = match job.state() {
                JobState::Finalizing => Ok(()),
                _ => job.transition(JobState::Finalizing),
            }
            .and_then(|()| job.succeed(object.clone()));

            match result {
                Ok(()) => {
                    ctx.persist(&job).await;
                    tracing::info!(
                        job_id = id.0,
                        path = %object.path,
                        size = object.size,
                        "job succeeded"
                    );
                    ctx.relay.emit_event(Event::Succeeded {
                        id,
                        object: object.clone(),
                    });
                    delete_origin_if_enabled(ctx, &job).await;
                }
                Err(e) => tracing::error!(job_id = id.0, error = %e, "cannot record success"),
            }
        }
        TransferOutcome::Canceled => {
            if let Some(token) = job.take_session() {
                sessions.abort(&token).await;
            }
            match job.cancel() {
                Ok(()) => {
                    ctx.persist(&job).await;
                    tracing::info!(job_id = id.0, committed = job.bytes_transferred(), "job canceled");
                    ctx.relay.emit_event(Event::Canceled { id });
                }
                Err(e) => tracing::error!(job_id = id.0, error = %e, "cannot record cancellation"),
            }
        }
        TransferOutcome::Interrupted => {
            // Keep the session so the next start resumes from the committed range
            match job.requeue() {
                Ok(()) => {
                    ctx.persist(&job).await;
                    tracing::info!(
                        job_id = id.0,
                        committed = job.bytes_transferred(),
                        "job interrupted by shutdown, will resume on restart"
                    );
                }
                Err(e) => tracing::error!(job_id = id.0, error = %e, "cannot requeue job"),
            }
        }
        TransferOutcome::Failed(error) => {
            if let Some(token) = job.take_session() {
                sessions.abort(&token).await;
            }
            let reason = error.user_message();
            match job.fail(reason.clone()) {
                Ok(()) => {
                    ctx.persist(&job).await;
                    tracing::error!(
                        job_id = id.0,
                        code = error.code(),
                        committed = job.bytes_transferred(),
                        error = %error,
                        "job failed"
                    );
                    ctx.relay.emit_event(Event::Failed { id, error: reason });
                }
                Err(e) => tracing::error!(job_id = id.0, error = %e, "cannot record failure"),
            }
        }
    }

    ctx.report(&job).await;
    ctx.remove_from_active().await;

    if job.state().is_terminal() {
        ctx.relay.complete_group_if_finished(job.group_id).await;
    }
}

/// Delete the message that carried the source, when auto-delete is on
async fn delete_origin_if_enabled(ctx: &JobTaskContext, job: &Job) {
    if !ctx.relay.auto_delete() {
        return;
    }
    let Some(origin) = job.source.origin_message() else {
        return;
    };
    let surface = ctx.relay.pipeline.reporter.surface();
    match surface.delete_message(origin).await {
        Ok(()) => tracing::debug!(job_id = job.id.0, message = %origin, "origin message deleted"),
        Err(e) => {
            tracing::warn!(job_id = job.id.0, message = %origin, error = %e, "failed to delete origin message")
        }
    }
}
