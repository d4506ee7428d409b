//! Streaming upload: source chunks into a resumable upload session.
//!
//! Each pass opens the source at the store's committed offset, so a failed read or a lost
//! session resumes instead of restarting. Chunks go out strictly in offset order and
//! cancellation is checked between chunks, never during a send.

use crate::error::{Error, FetchError, StoreError};
use crate::job::Job;
use crate::retry::{Backoff, IsRetryable};
use crate::source::ChunkReader;
use crate::store::{ChunkAck, UploadSessionToken};
use crate::types::{JobState, ObjectDescriptor};

use super::context::{JobTaskContext, TransferOutcome};

/// How one pass over the source ended
enum Pass {
    /// The job reached an outcome
    Done(TransferOutcome),
    /// Reading failed; reopen at the committed offset
    ReadFailed(FetchError),
    /// The store forgot the session; start over with a new one
    SessionLost,
}

/// Stream the job's source into the store
pub(super) async fn stream_to_store(ctx: &JobTaskContext, job: &mut Job) -> TransferOutcome {
    let retry = ctx.config().retry.clone();
    // Read retries are budgeted across passes of one job
    let mut read_backoff = Backoff::new(&retry);
    let mut session_restarts = 0u32;

    loop {
        if ctx.cancel_token.is_cancelled() {
            return ctx.cancel_outcome();
        }

        let offset = match resume_offset(ctx, job).await {
            Ok(offset) => offset,
            Err(e) => return TransferOutcome::Failed(Error::Store(e)),
        };

        // A resumed pass after a failed read re-enters Fetching
        if job.state() == JobState::Uploading
            && let Err(e) = ctx.advance(job, JobState::Fetching).await
        {
            return TransferOutcome::Failed(e.into());
        }

        let sources = &ctx.relay.pipeline.sources;
        let opened = tokio::select! {
            _ = ctx.cancel_token.cancelled() => return ctx.cancel_outcome(),
            opened = sources.open(&job.source, offset) => opened,
        };

        let pass = match opened {
            Ok(opened) => {
                job.set_bytes_total(opened.size);
                tracing::debug!(
                    job_id = job.id.0,
                    offset,
                    size = ?opened.size,
                    "source opened"
                );
                let transfer = &ctx.config().transfer;
                let reader = ChunkReader::spawn(
                    opened.stream,
                    offset,
                    ctx.relay.pipeline.sessions.chunk_size(),
                    transfer.read_ahead_chunks,
                    transfer.read_timeout,
                );
                pump(ctx, job, reader, offset).await
            }
            Err(e) => Pass::ReadFailed(e),
        };

        match pass {
            Pass::Done(outcome) => return outcome,
            Pass::ReadFailed(e) if e.is_retryable() => {
                tracing::warn!(
                    job_id = job.id.0,
                    committed = job.bytes_transferred(),
                    error = %e,
                    "source read failed, resuming from committed offset"
                );
                let Some(delay) = read_backoff.next_delay() else {
                    return TransferOutcome::Failed(Error::Fetch(e));
                };
                tokio::select! {
                    _ = ctx.cancel_token.cancelled() => return ctx.cancel_outcome(),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Pass::ReadFailed(e) => return TransferOutcome::Failed(Error::Fetch(e)),
            Pass::SessionLost => {
                session_restarts += 1;
                if session_restarts > retry.max_attempts {
                    return TransferOutcome::Failed(Error::Store(StoreError::SessionLost));
                }
                tracing::warn!(
                    job_id = job.id.0,
                    committed = job.bytes_transferred(),
                    "upload session lost, starting a new one"
                );
                if let Some(stale) = job.take_session() {
                    ctx.relay.pipeline.sessions.abort(&stale).await;
                }
                ctx.persist(job).await;
            }
        }
    }
}

/// Offset to resume from: the committed end of the job's session, or 0 without one
async fn resume_offset(ctx: &JobTaskContext, job: &mut Job) -> Result<u64, StoreError> {
    let Some(token) = job.session_token().cloned() else {
        return Ok(0);
    };
    match ctx.relay.pipeline.sessions.committed_offset(&token).await {
        Ok(offset) => {
            tracing::debug!(job_id = job.id.0, offset, "resuming upload session");
            Ok(offset)
        }
        Err(StoreError::SessionLost) => {
            tracing::info!(job_id = job.id.0, "stored upload session expired, starting over");
            job.take_session();
            ctx.persist(job).await;
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Send every chunk the reader yields, then finalize
async fn pump(ctx: &JobTaskContext, job: &mut Job, mut reader: ChunkReader, start: u64) -> Pass {
    let sessions = &ctx.relay.pipeline.sessions;
    let mut completed: Option<ObjectDescriptor> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => return Pass::Done(ctx.cancel_outcome()),
            next = reader.next_chunk() => next,
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return Pass::ReadFailed(e),
        };

        let token = match ensure_session(ctx, job).await {
            Ok(token) => token,
            Err(e) => return Pass::Done(TransferOutcome::Failed(Error::Store(e))),
        };

        if job.state() != JobState::Uploading
            && let Err(e) = ctx.advance(job, JobState::Uploading).await
        {
            return Pass::Done(TransferOutcome::Failed(e.into()));
        }

        let ack = sessions
            .send_chunk(&token, &chunk, |attempt, e| {
                tracing::warn!(
                    job_id = job.id.0,
                    offset = chunk.offset,
                    attempt,
                    error = %e,
                    "chunk send failed, retrying"
                );
                job.record_retry(e.to_string());
            })
            .await;

        match ack {
            Ok(ack) => {
                let committed = ack.committed_end(chunk.end());
                if let ChunkAck::Completed(descriptor) = ack {
                    completed = Some(descriptor);
                }
                ctx.progress(job, committed).await;
                if chunk.is_last {
                    break;
                }
            }
            Err(StoreError::SessionLost) => return Pass::SessionLost,
            Err(e) => return Pass::Done(TransferOutcome::Failed(Error::Store(e))),
        }
    }

    let Some(token) = job.session_token().cloned() else {
        // Nothing was read, so no session was opened
        if start == 0 {
            return Pass::Done(TransferOutcome::Failed(Error::Fetch(FetchError::EmptySource)));
        }
        return Pass::SessionLost;
    };

    if job.state() != JobState::Finalizing
        && let Err(e) = ctx.advance(job, JobState::Finalizing).await
    {
        return Pass::Done(TransferOutcome::Failed(e.into()));
    }

    match sessions
        .finalize(&token, &job.destination_path, job.bytes_transferred(), completed)
        .await
    {
        Ok(object) => Pass::Done(TransferOutcome::Stored(object)),
        Err(StoreError::SessionLost) => Pass::SessionLost,
        Err(e) => Pass::Done(TransferOutcome::Failed(Error::Store(e))),
    }
}

/// The job's session, opened on the first chunk
async fn ensure_session(
    ctx: &JobTaskContext,
    job: &mut Job,
) -> Result<UploadSessionToken, StoreError> {
    if let Some(token) = job.session_token() {
        return Ok(token.clone());
    }
    let token = ctx
        .relay
        .pipeline
        .sessions
        .open(&job.destination_path, job.bytes_total())
        .await?;
    job.issue_session(token.clone());
    ctx.persist(job).await;
    tracing::info!(
        job_id = job.id.0,
        destination = %job.destination_path,
        size = ?job.bytes_total(),
        "upload session opened"
    );
    Ok(token)
}
