//! In-memory destination store with fault injection
//!
//! Enforces the same rules as the Graph upload API (sequential ranges, quantum-aligned
//! non-final chunks, objects created only on completion) so pipeline behavior can be checked
//! without a network.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CommittedRange, DestinationStore, PutOutcome, UploadSessionToken};
use crate::error::{StoreError, StoreRejection};
use crate::types::ObjectDescriptor;

/// How an injected `put_range` failure behaves
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutFault {
    /// Fail before storing anything
    Drop,
    /// Store the bytes, then report failure as if the acknowledgement was lost
    LoseAck,
    /// Refuse with a terminal rejection
    Reject(StoreRejection),
    /// Forget the session, as if it expired
    Expire,
}

#[derive(Debug)]
struct Session {
    path: String,
    data: Vec<u8>,
    // Total carried by the final range
    declared_total: Option<u64>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    objects: HashMap<String, (String, Bytes)>,
    faults: HashMap<u64, VecDeque<PutFault>>,
    urls: HashMap<String, Bytes>,
    put_log: Vec<(u64, usize)>,
    aborted: Vec<String>,
}

/// Destination store backed by process memory
pub struct MemoryStore {
    quantum: usize,
    max_chunk: usize,
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create a store with the given quantum and a maximum chunk of 192 quanta
    pub fn new(quantum: usize) -> Self {
        Self::with_limits(quantum, quantum * 192)
    }

    /// Create a store with an explicit maximum chunk size
    pub fn with_limits(quantum: usize, max_chunk: usize) -> Self {
        Self {
            quantum: quantum.max(1),
            max_chunk: max_chunk.max(quantum.max(1)),
            next_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Queue `times` failures of kind `fault` for the put at `offset`
    pub fn inject_put_fault(&self, offset: u64, fault: PutFault, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(offset).or_default();
        for _ in 0..times {
            queue.push_back(fault.clone());
        }
    }

    /// Make `url` fetchable by [`DestinationStore::fetch_by_url`]; other URLs are rejected
    pub fn serve_url(&self, url: &str, body: impl Into<Bytes>) {
        self.lock().urls.insert(url.to_string(), body.into());
    }

    /// Finalized object bytes at `path`
    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.lock().objects.get(path).map(|(_, data)| data.clone())
    }

    /// Paths of every finalized object
    pub fn object_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().objects.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Sessions still open
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Paths of sessions discarded by `abort`
    pub fn aborted_paths(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Every accepted or attempted put as `(offset, len)`, in call order
    pub fn put_log(&self) -> Vec<(u64, usize)> {
        self.lock().put_log.clone()
    }
}

#[async_trait::async_trait]
impl DestinationStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn quantum(&self) -> usize {
        self.quantum
    }

    fn max_chunk_size(&self) -> usize {
        self.max_chunk
    }

    async fn create_upload_session(
        &self,
        path: &str,
        size_hint: Option<u64>,
    ) -> Result<UploadSessionToken, StoreError> {
        let token = format!("mem-session-{}", self.next_id());
        self.lock().sessions.insert(
            token.clone(),
            Session {
                path: path.to_string(),
                data: Vec::with_capacity(size_hint.unwrap_or(0).min(1 << 20) as usize),
                declared_total: None,
            },
        );
        Ok(UploadSessionToken(token))
    }

    async fn query_committed_range(
        &self,
        token: &UploadSessionToken,
    ) -> Result<CommittedRange, StoreError> {
        let state = self.lock();
        let session = state
            .sessions
            .get(token.as_str())
            .ok_or(StoreError::SessionLost)?;
        Ok(CommittedRange {
            start: 0,
            end: session.data.len() as u64,
        })
    }

    async fn put_range(
        &self,
        token: &UploadSessionToken,
        data: Bytes,
        offset: u64,
        total: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        let mut state = self.lock();
        state.put_log.push((offset, data.len()));

        let fault = state.faults.get_mut(&offset).and_then(VecDeque::pop_front);

        if fault == Some(PutFault::Expire) {
            state.sessions.remove(token.as_str());
            return Err(StoreError::SessionLost);
        }

        let quantum = self.quantum;
        let max_chunk = self.max_chunk;
        let session = state
            .sessions
            .get_mut(token.as_str())
            .ok_or(StoreError::SessionLost)?;

        match &fault {
            Some(PutFault::Drop) => {
                return Err(StoreError::ChunkSend(format!(
                    "injected failure at offset {offset}"
                )));
            }
            Some(PutFault::Reject(rejection)) => {
                return Err(StoreError::Rejected(rejection.clone()));
            }
            Some(PutFault::LoseAck | PutFault::Expire) | None => {}
        }

        if data.len() > max_chunk {
            return Err(StoreError::Rejected(StoreRejection::InvalidRequest(
                format!("chunk of {} bytes exceeds {max_chunk}", data.len()),
            )));
        }

        let committed = session.data.len() as u64;
        let end = offset + data.len() as u64;
        let is_final = total == Some(end);
        if !is_final && data.len() % quantum != 0 {
            return Err(StoreError::Rejected(StoreRejection::InvalidRequest(
                format!("non-final chunk of {} bytes is not a multiple of {quantum}", data.len()),
            )));
        }
        if offset > committed {
            return Err(StoreError::Protocol(format!(
                "range starts at {offset} but only {committed} bytes are committed"
            )));
        }

        // Overlapping resend: keep only the bytes past the committed end
        if end > committed {
            let skip = (committed - offset) as usize;
            session.data.extend_from_slice(&data[skip..]);
        }
        if is_final {
            session.declared_total = total;
        }

        if fault == Some(PutFault::LoseAck) {
            return Err(StoreError::ChunkSend(format!(
                "injected lost acknowledgement at offset {offset}"
            )));
        }

        Ok(PutOutcome::Accepted {
            next_expected: Some(session.data.len() as u64),
        })
    }

    async fn complete(
        &self,
        token: &UploadSessionToken,
        _path: &str,
    ) -> Result<ObjectDescriptor, StoreError> {
        let id = self.next_id();
        let mut state = self.lock();
        let session = state
            .sessions
            .remove(token.as_str())
            .ok_or(StoreError::SessionLost)?;

        let size = session.data.len() as u64;
        if let Some(declared) = session.declared_total
            && declared != size
        {
            let path = session.path.clone();
            state.sessions.insert(token.0.clone(), session);
            return Err(StoreError::Protocol(format!(
                "{path}: declared {declared} bytes but received {size}"
            )));
        }

        let descriptor = ObjectDescriptor {
            id: format!("mem-item-{id}"),
            path: session.path.clone(),
            size,
        };
        state
            .objects
            .insert(session.path, (descriptor.id.clone(), Bytes::from(session.data)));
        Ok(descriptor)
    }

    async fn abort(&self, token: &UploadSessionToken) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(session) = state.sessions.remove(token.as_str()) {
            state.aborted.push(session.path);
        }
        Ok(())
    }

    async fn fetch_by_url(&self, path: &str, url: &str) -> Result<ObjectDescriptor, StoreError> {
        let id = self.next_id();
        let mut state = self.lock();
        let Some(body) = state.urls.get(url).cloned() else {
            return Err(StoreError::Rejected(StoreRejection::InvalidRequest(format!(
                "url not reachable from store: {url}"
            ))));
        };
        let descriptor = ObjectDescriptor {
            id: format!("mem-item-{id}"),
            path: path.to_string(),
            size: body.len() as u64,
        };
        state
            .objects
            .insert(path.to_string(), (descriptor.id.clone(), body));
        Ok(descriptor)
    }
}
