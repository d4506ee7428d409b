//! Destination store abstraction and the Upload Session Manager
//!
//! [`DestinationStore`] is the seam to the cloud drive. [`OneDriveStore`] talks to Microsoft
//! Graph; [`MemoryStore`] keeps everything in memory and can inject faults.
//! [`UploadSessionManager`] layers chunk-size negotiation, per-chunk timeouts, retries and
//! committed-range resume on top of any store.

mod memory;
mod onedrive;
mod session;

pub use memory::{MemoryStore, PutFault};
pub use onedrive::{OneDriveStore, StaticToken, TokenProvider};
pub use session::{ChunkAck, UploadSessionManager, negotiate_chunk_size};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StoreError;
use crate::types::ObjectDescriptor;

/// Opaque handle to an in-progress resumable upload
///
/// For Graph this is the pre-authorized upload URL.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadSessionToken(pub String);

impl UploadSessionToken {
    /// Borrow the raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Upload URLs embed credentials; keep them out of logs.
impl fmt::Debug for UploadSessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadSessionToken({} chars)", self.0.len())
    }
}

/// Bytes the store already holds for a session: `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommittedRange {
    /// First committed byte (always 0 for sequential uploads)
    pub start: u64,
    /// One past the last committed byte; the next offset to send
    pub end: u64,
}

/// Store answer to one `put_range`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Range accepted; more bytes expected
    Accepted {
        /// Next offset the store expects, when it says
        next_expected: Option<u64>,
    },
    /// Final range accepted and the object created
    Completed(ObjectDescriptor),
}

/// A cloud drive that accepts resumable uploads
#[async_trait::async_trait]
pub trait DestinationStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Alignment every non-final chunk must be a multiple of
    fn quantum(&self) -> usize;

    /// Largest chunk accepted in one request
    fn max_chunk_size(&self) -> usize;

    /// Open a resumable upload for `path`; `size_hint` is advisory
    async fn create_upload_session(
        &self,
        path: &str,
        size_hint: Option<u64>,
    ) -> Result<UploadSessionToken, StoreError>;

    /// Bytes committed so far
    async fn query_committed_range(
        &self,
        token: &UploadSessionToken,
    ) -> Result<CommittedRange, StoreError>;

    /// Send `data` at `offset`
    ///
    /// `total` is the object's full size, `None` when not yet known. The final range must
    /// carry the exact total.
    async fn put_range(
        &self,
        token: &UploadSessionToken,
        data: Bytes,
        offset: u64,
        total: Option<u64>,
    ) -> Result<PutOutcome, StoreError>;

    /// Confirm the object after the final range and describe it
    ///
    /// `path` is the session's destination. A store that cannot tie a finished item to this
    /// session answers [`StoreError::SessionLost`] rather than guessing.
    async fn complete(
        &self,
        token: &UploadSessionToken,
        path: &str,
    ) -> Result<ObjectDescriptor, StoreError>;

    /// Discard a session so no partial object remains
    async fn abort(&self, token: &UploadSessionToken) -> Result<(), StoreError>;

    /// Have the store download `url` into `path` itself
    async fn fetch_by_url(&self, path: &str, url: &str) -> Result<ObjectDescriptor, StoreError>;
}
