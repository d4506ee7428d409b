//! Shared test helpers for creating Relay instances in tests.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

use crate::config::{Config, RetryConfig};
use crate::error::{FetchError, Result};
use crate::relay::Relay;
use crate::source::{ContentProxy, MediaInfo, SourceStream};
use crate::status::ConversationSurface;
use crate::store::DestinationStore;
use crate::types::{ChatRef, Event, JobId, JobState, MessageRef};

/// Chat the tests send requests from
pub(crate) fn chat() -> ChatRef {
    ChatRef::Id(-100_200)
}

pub(crate) fn message(id: i32) -> MessageRef {
    MessageRef::new(chat(), id)
}

struct FakeMedia {
    data: Bytes,
    info: MediaInfo,
}

/// Content proxy serving in-memory media
///
/// Reads can be held at the gate to keep jobs in `Fetching`, and can be made to fail
/// partway through a given number of times.
pub(crate) struct FakeProxy {
    media: Mutex<HashMap<MessageRef, FakeMedia>>,
    read_failures: Mutex<HashMap<MessageRef, usize>>,
    gate: watch::Sender<bool>,
    resumes_only: AtomicBool,
    block_size: usize,
    opens: Mutex<Vec<(MessageRef, u64)>>,
}

impl FakeProxy {
    pub(crate) fn new(block_size: usize) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            media: Mutex::new(HashMap::new()),
            read_failures: Mutex::new(HashMap::new()),
            gate,
            resumes_only: AtomicBool::new(false),
            block_size: block_size.max(1),
            opens: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add_media(&self, message: MessageRef, name: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let info = MediaInfo {
            file_id: i64::from(message.message_id),
            file_name: Some(name.to_string()),
            mime_type: None,
            size: Some(data.len() as u64),
            is_photo: false,
        };
        self.media
            .lock()
            .unwrap()
            .insert(message, FakeMedia { data, info });
    }

    /// Cut the next `times` reads of `message` off halfway
    pub(crate) fn fail_reads(&self, message: MessageRef, times: usize) {
        self.read_failures.lock().unwrap().insert(message, times);
    }

    /// Block every read until `release`
    pub(crate) fn hold(&self) {
        self.resumes_only.store(false, Ordering::SeqCst);
        self.gate.send_replace(false);
    }

    /// Block reads that resume past offset zero until `release`
    pub(crate) fn hold_resumes(&self) {
        self.resumes_only.store(true, Ordering::SeqCst);
        self.gate.send_replace(false);
    }

    /// Offsets every open of `message` started at
    pub(crate) fn open_offsets(&self, message: &MessageRef) -> Vec<u64> {
        self.opens
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == message)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub(crate) fn release(&self) {
        self.gate.send_replace(true);
    }

    fn stream(&self, message: &MessageRef, offset: u64) -> std::result::Result<SourceStream, FetchError> {
        let (data, size) = {
            let media = self.media.lock().unwrap();
            let entry = media
                .get(message)
                .ok_or_else(|| FetchError::MessageNotFound(message.to_string()))?;
            (entry.data.clone(), entry.data.len() as u64)
        };
        self.opens.lock().unwrap().push((message.clone(), offset));

        let rest = data.slice((offset as usize).min(data.len())..);
        let mut blocks: Vec<std::result::Result<Bytes, FetchError>> = Vec::new();
        let mut at = 0;
        while at < rest.len() {
            let end = (at + self.block_size).min(rest.len());
            blocks.push(Ok(rest.slice(at..end)));
            at = end;
        }

        let fail = {
            let mut failures = self.read_failures.lock().unwrap();
            match failures.get_mut(message) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            blocks.truncate(blocks.len() / 2);
            blocks.push(Err(FetchError::Read("connection reset by peer".into())));
        }

        Ok(SourceStream {
            stream: futures::stream::iter(blocks).boxed(),
            size: Some(size),
        })
    }

    async fn wait_at_gate(&self, offset: u64) {
        if offset == 0 && self.resumes_only.load(Ordering::SeqCst) {
            return;
        }
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[async_trait::async_trait]
impl ContentProxy for FakeProxy {
    async fn describe(&self, message: &MessageRef) -> std::result::Result<MediaInfo, FetchError> {
        self.media
            .lock()
            .unwrap()
            .get(message)
            .map(|m| m.info.clone())
            .ok_or_else(|| FetchError::MessageNotFound(message.to_string()))
    }

    async fn fetch_media(
        &self,
        message: &MessageRef,
        offset: u64,
    ) -> std::result::Result<SourceStream, FetchError> {
        self.wait_at_gate(offset).await;
        self.stream(message, offset)
    }

    async fn open_restricted(
        &self,
        channel: &ChatRef,
        message_id: i32,
        offset: u64,
    ) -> std::result::Result<SourceStream, FetchError> {
        self.wait_at_gate(offset).await;
        self.stream(&MessageRef::new(channel.clone(), message_id), offset)
    }

    async fn resolve_message_range(
        &self,
        channel: &ChatRef,
        start_id: i32,
        count: usize,
    ) -> std::result::Result<Vec<MessageRef>, FetchError> {
        let media = self.media.lock().unwrap();
        let mut ids: Vec<i32> = media
            .keys()
            .filter(|m| &m.chat == channel)
            .map(|m| m.message_id)
            .collect();
        ids.sort_unstable();
        let newest = ids.last().copied().unwrap_or(0);
        if start_id > newest {
            return Err(FetchError::ChannelEnd);
        }
        let end = i64::from(start_id) + count as i64;
        Ok(ids
            .into_iter()
            .filter(|&id| id >= start_id && i64::from(id) < end)
            .map(|id| MessageRef::new(channel.clone(), id))
            .collect())
    }
}

/// Conversation surface that records every call
#[derive(Default)]
pub(crate) struct RecordingSurface {
    pub(crate) sent: Mutex<Vec<(MessageRef, String)>>,
    pub(crate) edits: Mutex<Vec<(MessageRef, String)>>,
    pub(crate) deleted: Mutex<Vec<MessageRef>>,
}

impl RecordingSurface {
    /// Latest text of a status message
    pub(crate) fn last_text(&self, status: &MessageRef) -> Option<String> {
        let edits = self.edits.lock().unwrap();
        if let Some((_, text)) = edits.iter().rev().find(|(m, _)| m == status) {
            return Some(text.clone());
        }
        let sent = self.sent.lock().unwrap();
        sent.iter()
            .find(|(m, _)| m == status)
            .map(|(_, text)| text.clone())
    }
}

#[async_trait::async_trait]
impl ConversationSurface for RecordingSurface {
    async fn send_message(
        &self,
        chat: &ChatRef,
        _reply_to: Option<i32>,
        text: &str,
    ) -> Result<MessageRef> {
        let mut sent = self.sent.lock().unwrap();
        let message = MessageRef::new(chat.clone(), 9000 + sent.len() as i32);
        sent.push((message.clone(), text.to_string()));
        Ok(message)
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<()> {
        self.edits
            .lock()
            .unwrap()
            .push((message.clone(), text.to_string()));
        Ok(())
    }

    async fn delete_message(&self, message: &MessageRef) -> Result<()> {
        self.deleted.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Test configuration: small chunks, fast retries, quick status edits
pub(crate) fn test_config(temp_dir: &TempDir, chunk_size: usize) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("test.db");
    config.persistence.shutdown_timeout = Duration::from_secs(5);
    config.transfer.chunk_size = chunk_size;
    config.transfer.max_concurrent_jobs = 2;
    config.transfer.read_timeout = Duration::from_secs(5);
    config.transfer.send_timeout = Duration::from_secs(5);
    config.transfer.url_fetch_timeout = Duration::from_secs(5);
    config.status.edit_interval = Duration::from_millis(10);
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// Helper to create a test Relay over the given store and proxy.
/// The caller keeps the tempdir holding the database alive.
pub(crate) async fn create_test_relay(
    config: Config,
    store: Arc<dyn DestinationStore>,
    proxy: Arc<FakeProxy>,
) -> (Relay, Arc<RecordingSurface>) {
    let surface = Arc::new(RecordingSurface::default());
    let relay = Relay::new(config, proxy, store, surface.clone())
        .await
        .unwrap();
    (relay, surface)
}

/// Wait until the job reaches `state`
pub(crate) async fn wait_for_state(relay: &Relay, id: JobId, state: JobState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = relay.job(id).await.unwrap().map(|j| j.state);
            if current == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached {state}"));
}

/// Wait until no worker owns a job
pub(crate) async fn wait_until_idle(relay: &Relay) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !relay.active_jobs().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("workers never went idle");
}

/// Wait for the group-finished event of any group
pub(crate) async fn wait_for_group(events: &mut tokio::sync::broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event @ Event::GroupFinished { .. }) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("group never finished")
}

/// Committed byte counts of every progress event already delivered for `id`
pub(crate) fn drain_progress(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    id: JobId,
) -> Vec<u64> {
    use tokio::sync::broadcast::error::TryRecvError;

    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(Event::Uploading {
                id: job,
                bytes_transferred,
                ..
            }) if job == id => seen.push(bytes_transferred),
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return seen,
        }
    }
}

/// Progress never moves backwards, never passes `size` and ends at `size`
pub(crate) fn assert_progress_within(progress: &[u64], size: usize) {
    assert!(!progress.is_empty(), "no progress reported");
    assert!(
        progress.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {progress:?}"
    );
    assert!(
        progress.iter().all(|p| *p <= size as u64),
        "progress passed {size}: {progress:?}"
    );
    assert_eq!(progress.last().copied(), Some(size as u64), "{progress:?}");
}
