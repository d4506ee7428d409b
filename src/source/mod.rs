//! Chunk Stream Reader: byte sources and bounded chunking
//!
//! Chat media and restricted channel content are read through the external
//! [`ContentProxy`]; remote URLs through the local [`HttpFetcher`]. Either way the bytes
//! arrive as a [`ByteStream`] that [`ChunkReader`] re-chunks into quantum-aligned pieces
//! with bounded read-ahead.

mod chunker;
mod http;

pub use chunker::{Chunk, ChunkReader};
pub use http::{HttpFetcher, HttpSource};

use bytes::Bytes;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::FetchError;
use crate::types::{ChatRef, MessageRef, Source};

/// Forward-only stream of source bytes
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// An opened source positioned at the requested offset
pub struct SourceStream {
    /// Bytes from the requested offset onward
    pub stream: ByteStream,
    /// Size of the whole object when the source knows it
    pub size: Option<u64>,
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Metadata about the media attached to a chat message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Chat-assigned file id
    pub file_id: i64,
    /// Name the sender gave the file
    pub file_name: Option<String>,
    /// Declared MIME type
    pub mime_type: Option<String>,
    /// Size in bytes
    pub size: Option<u64>,
    /// Photos carry no name and are always JPEG
    pub is_photo: bool,
}

/// Access to chat content, implemented by the embedding application's chat client
///
/// The `offset` parameters let a resumed job continue reading where the store's committed
/// range ends instead of re-reading from the start.
#[async_trait::async_trait]
pub trait ContentProxy: Send + Sync {
    /// Describe the media on a message without reading it
    async fn describe(&self, message: &MessageRef) -> Result<MediaInfo, FetchError>;

    /// Stream the media attached to a message the relay's bot can see
    async fn fetch_media(
        &self,
        message: &MessageRef,
        offset: u64,
    ) -> Result<SourceStream, FetchError>;

    /// Stream media from a channel only the relay's user session can read
    async fn open_restricted(
        &self,
        channel: &ChatRef,
        message_id: i32,
        offset: u64,
    ) -> Result<SourceStream, FetchError>;

    /// Existing messages with media among ids `start_id .. start_id + count`, in id order
    ///
    /// Missing ids are skipped. Returns [`FetchError::ChannelEnd`] when `start_id` lies past
    /// the newest message and [`FetchError::PermissionDenied`] when the channel became
    /// unreadable.
    async fn resolve_message_range(
        &self,
        channel: &ChatRef,
        start_id: i32,
        count: usize,
    ) -> Result<Vec<MessageRef>, FetchError>;
}

/// Opens any [`Source`] as a byte stream
#[derive(Clone)]
pub struct SourceOpener {
    proxy: Arc<dyn ContentProxy>,
    http: HttpFetcher,
}

impl SourceOpener {
    /// Create an opener over the given proxy and HTTP fetcher
    pub fn new(proxy: Arc<dyn ContentProxy>, http: HttpFetcher) -> Self {
        Self { proxy, http }
    }

    /// The content proxy backing chat sources
    pub fn proxy(&self) -> &Arc<dyn ContentProxy> {
        &self.proxy
    }

    /// The HTTP fetcher backing URL sources
    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    /// Open `source` positioned at byte `offset`
    pub async fn open(&self, source: &Source, offset: u64) -> Result<SourceStream, FetchError> {
        match source {
            Source::ChatMedia { message } | Source::ForwardedMedia { message } => {
                self.proxy.fetch_media(message, offset).await
            }
            Source::RestrictedLink {
                channel,
                message_id,
            } => self.proxy.open_restricted(channel, *message_id, offset).await,
            Source::RemoteUrl { url } => {
                let opened = self.http.open(url, offset).await?;
                Ok(opened.into_stream())
            }
        }
    }
}
