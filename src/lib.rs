//! # chat-relay
//!
//! Relays media posted in a chat conversation, forwarded media, restricted channel links and
//! remote URLs into cloud object storage.
//!
//! ## Design Philosophy
//!
//! chat-relay is designed to be:
//! - **Streaming** - Bytes flow from the source to the store chunk by chunk; nothing is
//!   staged on disk and memory stays bounded by the read-ahead window
//! - **Resumable** - Uploads go through resumable sessions; transient failures resend only
//!   the bytes the store has not committed, and a restart picks up where the last run stopped
//! - **Library-first** - The chat client, the content proxy and the store are traits the
//!   embedding application implements or picks
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use chat_relay::{Config, Relay, Request, Source, MessageRef, ChatRef};
//! # use chat_relay::{ContentProxy, ConversationSurface};
//! # async fn example(
//! #     proxy: Arc<dyn ContentProxy>,
//! #     surface: Arc<dyn ConversationSurface>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let tokens = Arc::new(chat_relay::store::StaticToken("graph-access-token".into()));
//!
//! let relay = Relay::with_onedrive(config, proxy, tokens, surface).await?;
//! relay.start_queue_processor();
//!
//! // Subscribe to events
//! let mut events = relay.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! let trigger = MessageRef::new(ChatRef::Id(-1001), 42);
//! relay
//!     .handle(Request::Transfer {
//!         sources: vec![Source::ChatMedia { message: trigger.clone() }],
//!         trigger,
//!         directory: None,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Job record and state machine
pub mod job;
/// Message range expansion
pub mod range;
/// Job scheduler and transfer pipeline (decomposed into focused submodules)
pub mod relay;
/// Retry logic with exponential backoff
pub mod retry;
/// Sources: content proxy, HTTP fetching and chunking
pub mod source;
/// Status messages in the conversation
pub mod status;
/// Destination stores and upload sessions
pub mod store;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{DatabaseError, Error, FetchError, JobError, Result, StoreError, StoreRejection};
pub use job::{Job, JobSnapshot};
pub use range::{RangeExhausted, RangeStop};
pub use relay::{Admission, Relay};
pub use source::{ContentProxy, MediaInfo, SourceStream};
pub use status::{ConversationSurface, StatusReporter};
pub use store::{DestinationStore, MemoryStore, OneDriveStore, UploadSessionToken};
pub use types::{
    ChatRef, Event, GroupId, GroupState, JobId, JobState, MessageRef, ObjectDescriptor, Request,
    RequestOutcome, Source,
};

/// Helper function to run the relay with graceful signal handling.
///
/// Waits for a termination signal and then calls the relay's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, falling back to Ctrl+C if registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use chat_relay::{Relay, run_with_shutdown};
///
/// # async fn example(relay: Relay) -> Result<(), Box<dyn std::error::Error>> {
/// relay.start_queue_processor();
///
/// // Run with automatic signal handling
/// run_with_shutdown(relay).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_with_shutdown(relay: Relay) -> Result<()> {
    wait_for_signal().await;
    relay.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in sandboxes; ctrl_c still covers interactive runs
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "signal registration failed, waiting for ctrl_c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl_c");
            }
            return;
        }
    };

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    tracing::info!(signal = name, "shutting down on signal");
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
