//! Re-chunking of byte streams into quantum-aligned chunks with bounded read-ahead

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ByteStream;
use crate::error::FetchError;

/// A contiguous piece of the source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of `data` within the whole object
    pub offset: u64,
    /// Chunk bytes
    pub data: Bytes,
    /// No bytes follow this chunk
    pub is_last: bool,
}

impl Chunk {
    /// Number of bytes in the chunk
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk holds no bytes
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the chunk's final byte
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Pulls a [`ByteStream`] on a background task and hands out fixed-size chunks
///
/// Every chunk except the last is exactly `chunk_size` bytes, whatever block size the source
/// delivers. The background task stops pulling once `read_ahead` chunks are waiting, so the
/// reader never runs further ahead of the uploader than that. A one-chunk lookahead lets the
/// final chunk carry `is_last`, which the uploader needs to declare the total size.
pub struct ChunkReader {
    rx: mpsc::Receiver<Result<Chunk, FetchError>>,
    read_timeout: Duration,
    task: JoinHandle<()>,
    finished: bool,
}

impl ChunkReader {
    /// Start reading `stream`, whose first byte sits at `start_offset` in the object
    pub fn spawn(
        stream: ByteStream,
        start_offset: u64,
        chunk_size: usize,
        read_ahead: usize,
        read_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(read_ahead.max(1));
        let task = tokio::spawn(produce(stream, tx, start_offset, chunk_size.max(1)));
        Self {
            rx,
            read_timeout,
            task,
            finished: false,
        }
    }

    /// Next chunk, `Ok(None)` once the source is exhausted
    ///
    /// A chunk that does not arrive within the read timeout yields [`FetchError::Timeout`].
    /// After an error the reader is finished; reopen the source to continue.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, FetchError> {
        if self.finished {
            return Ok(None);
        }
        match tokio::time::timeout(self.read_timeout, self.rx.recv()).await {
            Err(_) => {
                self.finished = true;
                Err(FetchError::Timeout)
            }
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Some(Err(e))) => {
                self.finished = true;
                Err(e)
            }
            Ok(Some(Ok(chunk))) => {
                if chunk.is_last {
                    self.finished = true;
                }
                Ok(Some(chunk))
            }
        }
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn produce(
    mut stream: ByteStream,
    tx: mpsc::Sender<Result<Chunk, FetchError>>,
    start_offset: u64,
    chunk_size: usize,
) {
    let mut buf = BytesMut::with_capacity(chunk_size);
    let mut offset = start_offset;
    let mut pending: Option<Chunk> = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => {
                buf.extend_from_slice(&bytes);
                while buf.len() >= chunk_size {
                    let data = buf.split_to(chunk_size).freeze();
                    let chunk = Chunk {
                        offset,
                        data,
                        is_last: false,
                    };
                    offset = chunk.end();
                    if let Some(ready) = pending.replace(chunk)
                        && tx.send(Ok(ready)).await.is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(offset, error = %e, "source read failed");
                // Whole chunks read before the failure are still valid
                if let Some(ready) = pending.take()
                    && tx.send(Ok(ready)).await.is_err()
                {
                    return;
                }
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    if !buf.is_empty() {
        let chunk = Chunk {
            offset,
            data: buf.freeze(),
            is_last: false,
        };
        if let Some(ready) = pending.replace(chunk)
            && tx.send(Ok(ready)).await.is_err()
        {
            return;
        }
    }

    if let Some(mut last) = pending {
        last.is_last = true;
        let _ = tx.send(Ok(last)).await;
    }
}
