//! Store-side fetch of remote URLs, with local streaming as the fallback.

use crate::job::Job;
use crate::types::JobState;

use super::context::{JobTaskContext, TransferOutcome};

/// Ask the store to download `url` into the job's destination itself
///
/// Returns `None` when the store did not deliver the object; the caller then streams the
/// URL locally. Every failure, including a timeout, is eligible for that fallback.
pub(super) async fn delegate(
    ctx: &JobTaskContext,
    job: &mut Job,
    url: &str,
) -> Option<TransferOutcome> {
    let store = ctx.relay.pipeline.sessions.store().clone();
    let timeout = ctx.config().transfer.url_fetch_timeout;

    tracing::debug!(job_id = job.id.0, url, "asking store to fetch URL");

    let fetched = tokio::select! {
        _ = ctx.cancel_token.cancelled() => return Some(ctx.cancel_outcome()),
        fetched = tokio::time::timeout(timeout, store.fetch_by_url(&job.destination_path, url)) => fetched,
    };

    match fetched {
        Ok(Ok(object)) => {
            tracing::info!(
                job_id = job.id.0,
                path = %object.path,
                size = object.size,
                "store fetched URL"
            );
            if let Err(e) = ctx.advance(job, JobState::Finalizing).await {
                return Some(TransferOutcome::Failed(e.into()));
            }
            Some(TransferOutcome::Stored(object))
        }
        Ok(Err(e)) => {
            tracing::info!(
                job_id = job.id.0,
                store = store.name(),
                reason = %e,
                "store could not fetch URL, streaming it locally"
            );
            None
        }
        Err(_) => {
            tracing::warn!(
                job_id = job.id.0,
                timeout_secs = timeout.as_secs(),
                "store-side URL fetch timed out, streaming it locally"
            );
            None
        }
    }
}
