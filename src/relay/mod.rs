//! Job Scheduler split into focused submodules.
//!
//! The `Relay` struct and its methods are organized by domain:
//! - [`queue`] - Admission of job groups and the FIFO queue
//! - [`queue_processor`] - Bounded dispatch of queued jobs to workers
//! - [`control`] - Cancellation, auto-delete and job inspection
//! - [`requests`] - Conversational [`Request`](crate::types::Request) handling
//! - [`lifecycle`] - Shutdown coordination
//! - [`job_task`] - One job's transfer from source to store

mod control;
mod job_task;
mod lifecycle;
mod queue;
mod queue_processor;
mod requests;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use queue::Admission;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, Notify, Semaphore, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::source::{ContentProxy, HttpFetcher, SourceOpener};
use crate::status::{ConversationSurface, StatusReporter};
use crate::store::{DestinationStore, OneDriveStore, TokenProvider, UploadSessionManager};
use crate::types::{Event, JobId};

/// Queue and active job state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// Admitted jobs waiting for a worker, in admission order
    pub(crate) queue: Arc<Mutex<VecDeque<JobId>>>,
    /// Bounds concurrently active jobs (max_concurrent_jobs)
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Active jobs and their cancellation tokens
    pub(crate) active_jobs: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    /// Cleared during shutdown
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Wakes the queue processor when jobs are admitted
    pub(crate) queue_notify: Arc<Notify>,
    /// Parent of every job token; canceled only by shutdown
    pub(crate) shutdown: CancellationToken,
}

/// Runtime-mutable settings (separate from static config)
#[derive(Clone)]
pub(crate) struct RuntimeConfig {
    /// Delete the originating message after a job succeeds
    pub(crate) auto_delete: Arc<AtomicBool>,
}

/// Collaborators every job task uses
#[derive(Clone)]
pub(crate) struct Pipeline {
    /// Opens sources at an offset
    pub(crate) sources: SourceOpener,
    /// Drives upload sessions against the store
    pub(crate) sessions: UploadSessionManager,
    /// Projects groups onto status messages
    pub(crate) reporter: Arc<StatusReporter>,
}

/// Main relay instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Relay {
    /// Database instance for persistence
    /// Public for integration tests to query job state
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Queue and active job state
    pub(crate) queue_state: QueueState,
    /// Runtime-mutable settings
    pub(crate) runtime_config: RuntimeConfig,
    /// Source, store and status collaborators
    pub(crate) pipeline: Pipeline,
}

impl Relay {
    /// Create a new Relay instance
    ///
    /// This initializes all core components:
    /// - Opens/creates the SQLite database and runs migrations
    /// - Loads the persisted auto-delete flag
    /// - Sets up the event broadcast channel
    /// - Restores jobs left unfinished by the previous run
    ///
    /// Call [`start_queue_processor`](Self::start_queue_processor) to begin dispatching.
    pub async fn new(
        config: Config,
        proxy: Arc<dyn ContentProxy>,
        store: Arc<dyn DestinationStore>,
        surface: Arc<dyn ConversationSurface>,
    ) -> Result<Self> {
        let db = Database::new(&config.persistence.database_path).await?;

        if db.was_unclean_shutdown().await? {
            tracing::warn!("previous run did not shut down cleanly, resuming unfinished jobs");
        }
        db.set_clean_start().await?;

        let auto_delete = db
            .get_auto_delete()
            .await?
            .unwrap_or(config.transfer.auto_delete);

        // Buffer of 1000 events per subscriber
        let (event_tx, _rx) = broadcast::channel(1000);

        let http = HttpFetcher::new(config.transfer.read_timeout)?;
        let sessions = UploadSessionManager::new(
            store,
            config.retry.clone(),
            config.transfer.send_timeout,
            config.transfer.chunk_size,
        );
        let db = Arc::new(db);
        let reporter = Arc::new(StatusReporter::new(
            surface,
            db.clone(),
            config.status.clone(),
        ));

        let queue_state = QueueState {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            concurrent_limit: Arc::new(Semaphore::new(config.transfer.max_concurrent_jobs.max(1))),
            active_jobs: Arc::new(Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            queue_notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        };

        let relay = Self {
            db,
            event_tx,
            config: Arc::new(config),
            queue_state,
            runtime_config: RuntimeConfig {
                auto_delete: Arc::new(AtomicBool::new(auto_delete)),
            },
            pipeline: Pipeline {
                sources: SourceOpener::new(proxy, http),
                sessions,
                reporter,
            },
        };

        relay.restore_queue().await?;

        tracing::info!(
            store = relay.pipeline.sessions.store().name(),
            chunk_size = relay.pipeline.sessions.chunk_size(),
            max_concurrent_jobs = relay.config.transfer.max_concurrent_jobs,
            auto_delete,
            "relay initialized"
        );

        Ok(relay)
    }

    /// Create a relay uploading to OneDrive with the configured Graph settings
    pub async fn with_onedrive(
        config: Config,
        proxy: Arc<dyn ContentProxy>,
        tokens: Arc<dyn TokenProvider>,
        surface: Arc<dyn ConversationSurface>,
    ) -> Result<Self> {
        let store = Arc::new(OneDriveStore::new(config.onedrive.clone(), tokens)?);
        Self::new(config, proxy, store, surface).await
    }

    /// Subscribe to job events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls behind by more than 1000 events receives
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Events as a stream; lagged gaps are logged and skipped
    pub fn event_stream(&self) -> impl Stream<Item = Event> + Send + 'static {
        BroadcastStream::new(self.event_tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                    None
                }
            }
        })
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Whether new requests are admitted
    pub fn is_accepting(&self) -> bool {
        self.queue_state.accepting_new.load(Ordering::SeqCst)
    }

    /// Emit an event to all subscribers
    ///
    /// Events are dropped silently when nobody is subscribed.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}
