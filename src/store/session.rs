//! Upload Session Manager: chunk sizing, timeouts, retries and committed-range resume

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::{DestinationStore, PutOutcome, UploadSessionToken};
use crate::config::RetryConfig;
use crate::error::StoreError;
use crate::retry::{with_retry, with_retry_observed};
use crate::source::Chunk;
use crate::types::ObjectDescriptor;

/// Largest multiple of `quantum` that is no more than `requested` and `max`, and at least one quantum
pub fn negotiate_chunk_size(requested: usize, quantum: usize, max: usize) -> usize {
    let quantum = quantum.max(1);
    let cap = (max / quantum).max(1) * quantum;
    let aligned = (requested / quantum) * quantum;
    aligned.clamp(quantum, cap)
}

/// Result of sending one chunk
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkAck {
    /// Bytes committed; the store expects `next_offset` next
    Committed {
        /// Committed end of the object so far
        next_offset: u64,
    },
    /// The store created the object on this chunk
    Completed(ObjectDescriptor),
}

impl ChunkAck {
    /// Committed end after this chunk, given the chunk's end offset
    pub fn committed_end(&self, chunk_end: u64) -> u64 {
        match self {
            ChunkAck::Committed { next_offset } => *next_offset,
            ChunkAck::Completed(descriptor) => descriptor.size.max(chunk_end),
        }
    }
}

/// Drives one store's resumable uploads for the pipeline
///
/// Each job's worker owns its session token; the manager itself is stateless and shared.
#[derive(Clone)]
pub struct UploadSessionManager {
    store: Arc<dyn DestinationStore>,
    retry: RetryConfig,
    send_timeout: Duration,
    chunk_size: usize,
}

impl UploadSessionManager {
    /// Create a manager; `requested_chunk_size` is aligned to the store's quantum
    pub fn new(
        store: Arc<dyn DestinationStore>,
        retry: RetryConfig,
        send_timeout: Duration,
        requested_chunk_size: usize,
    ) -> Self {
        let chunk_size =
            negotiate_chunk_size(requested_chunk_size, store.quantum(), store.max_chunk_size());
        if chunk_size != requested_chunk_size {
            tracing::debug!(
                store = store.name(),
                requested = requested_chunk_size,
                effective = chunk_size,
                "chunk size aligned to store quantum"
            );
        }
        Self {
            store,
            retry,
            send_timeout,
            chunk_size,
        }
    }

    /// The store behind this manager
    pub fn store(&self) -> &Arc<dyn DestinationStore> {
        &self.store
    }

    /// Effective chunk size every non-final chunk must have
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.send_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    /// Open a resumable upload session for `path`
    pub async fn open(
        &self,
        path: &str,
        size_hint: Option<u64>,
    ) -> Result<UploadSessionToken, StoreError> {
        let token = with_retry(&self.retry, || {
            self.timed(self.store.create_upload_session(path, size_hint))
        })
        .await?;
        tracing::debug!(path, ?size_hint, "upload session opened");
        Ok(token)
    }

    /// Offset the store expects next for an existing session
    ///
    /// Fails with [`StoreError::SessionLost`] when the session expired; the caller then
    /// starts over with a new session.
    pub async fn committed_offset(&self, token: &UploadSessionToken) -> Result<u64, StoreError> {
        let range = with_retry(&self.retry, || {
            self.timed(self.store.query_committed_range(token))
        })
        .await?;
        Ok(range.end)
    }

    /// Send one chunk, retrying transient failures
    ///
    /// Retries first ask the store which bytes it already holds and resend only the rest, so
    /// a chunk whose acknowledgement was lost is never written twice. `on_retry` is called
    /// with the retry number and the failure before each backoff.
    pub async fn send_chunk<O>(
        &self,
        token: &UploadSessionToken,
        chunk: &Chunk,
        on_retry: O,
    ) -> Result<ChunkAck, StoreError>
    where
        O: FnMut(u32, &StoreError),
    {
        let attempts = AtomicU32::new(0);
        let total = chunk.is_last.then(|| chunk.end());

        with_retry_observed(&self.retry, on_retry, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut offset = chunk.offset;
                let mut data = chunk.data.clone();

                if attempt > 0 {
                    let committed = match self.timed(self.store.query_committed_range(token)).await
                    {
                        Ok(range) => range.end,
                        // The final range may have completed the upload before its ack was lost
                        Err(StoreError::SessionLost) if chunk.is_last => {
                            return Ok(ChunkAck::Committed {
                                next_offset: chunk.end(),
                            });
                        }
                        Err(e) => return Err(e),
                    };
                    if committed >= chunk.end() {
                        tracing::debug!(offset = chunk.offset, "chunk already committed");
                        return Ok(ChunkAck::Committed {
                            next_offset: committed,
                        });
                    }
                    if committed < chunk.offset {
                        return Err(StoreError::Protocol(format!(
                            "store holds {committed} bytes but chunk starts at {}",
                            chunk.offset
                        )));
                    }
                    data = chunk.data.slice((committed - chunk.offset) as usize..);
                    offset = committed;
                }

                match self
                    .timed(self.store.put_range(token, data, offset, total))
                    .await?
                {
                    PutOutcome::Accepted { next_expected } => Ok(ChunkAck::Committed {
                        next_offset: next_expected.unwrap_or(chunk.end()).max(chunk.end()),
                    }),
                    PutOutcome::Completed(descriptor) => Ok(ChunkAck::Completed(descriptor)),
                }
            }
        })
        .await
    }

    /// Confirm the object once the reader signaled end of stream
    ///
    /// `completed` is the descriptor returned with the final chunk, when the store sent one.
    /// The confirmed object must hold exactly `committed` bytes; anything else means this
    /// session's upload did not land and is reported as [`StoreError::SessionLost`].
    pub async fn finalize(
        &self,
        token: &UploadSessionToken,
        path: &str,
        committed: u64,
        completed: Option<ObjectDescriptor>,
    ) -> Result<ObjectDescriptor, StoreError> {
        let descriptor = match completed {
            Some(descriptor) => descriptor,
            None => {
                with_retry(&self.retry, || self.timed(self.store.complete(token, path))).await?
            }
        };
        if descriptor.size != committed {
            tracing::warn!(
                path,
                committed,
                confirmed = descriptor.size,
                item = %descriptor.id,
                "confirmed object does not match the uploaded bytes"
            );
            return Err(StoreError::SessionLost);
        }
        Ok(descriptor)
    }

    /// Discard a session; failures are logged, not returned
    pub async fn abort(&self, token: &UploadSessionToken) {
        if let Err(e) = self.timed(self.store.abort(token)).await {
            tracing::warn!(error = %e, "failed to discard upload session");
        }
    }
}
