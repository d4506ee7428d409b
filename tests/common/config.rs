//! Test configuration helpers for creating relays and loading live credentials from .env

use chat_relay::config::RetryConfig;
use chat_relay::store::StaticToken;
use chat_relay::{Config, ContentProxy, DestinationStore, Relay};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::fixtures::RecordingSurface;

/// Error type for test configuration
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Configuration with fast retries, quick status edits and the database in `temp_dir`
pub fn fast_config(temp_dir: &TempDir, chunk_size: usize, max_concurrent_jobs: usize) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("relay.db");
    config.transfer.chunk_size = chunk_size;
    config.transfer.max_concurrent_jobs = max_concurrent_jobs;
    config.status.edit_interval = Duration::from_millis(20);
    config.retry = RetryConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(20),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

/// Create a relay over the given collaborators and start its queue processor
///
/// Returns the relay, its surface and the temp directory (keep temp_dir alive for the test)
pub async fn start_relay(
    chunk_size: usize,
    max_concurrent_jobs: usize,
    proxy: Arc<dyn ContentProxy>,
    store: Arc<dyn DestinationStore>,
) -> (Relay, Arc<RecordingSurface>, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = fast_config(&temp_dir, chunk_size, max_concurrent_jobs);
    let surface = Arc::new(RecordingSurface::default());
    let relay = Relay::new(config, proxy, store, surface.clone())
        .await
        .unwrap();
    relay.start_queue_processor();
    (relay, surface, temp_dir)
}

/// Live OneDrive settings from environment variables
///
/// Required environment variables:
/// - `ONEDRIVE_ACCESS_TOKEN` - Graph bearer token with Files.ReadWrite
///
/// Optional environment variables:
/// - `ONEDRIVE_DRIVE` - Drive selector (default: `me/drive`)
/// - `ONEDRIVE_TEST_ROOT` - Destination folder (default: `/chat-relay-tests`)
pub fn load_live_config(temp_dir: &TempDir) -> Result<(Config, Arc<StaticToken>), ConfigError> {
    dotenvy::dotenv().ok();

    let token = std::env::var("ONEDRIVE_ACCESS_TOKEN")
        .map_err(|_| ConfigError("ONEDRIVE_ACCESS_TOKEN not set in environment".to_string()))?;

    let mut config = Config::default();
    config.persistence.database_path = temp_dir.path().join("live.db");
    config.status.edit_interval = Duration::from_millis(200);
    if let Ok(drive) = std::env::var("ONEDRIVE_DRIVE") {
        config.onedrive.drive = drive;
    }
    config.transfer.destination_root = std::env::var("ONEDRIVE_TEST_ROOT")
        .unwrap_or_else(|_| "/chat-relay-tests".to_string());

    Ok((config, Arc::new(StaticToken(token))))
}

/// Check if live OneDrive credentials are available
pub fn has_live_credentials() -> bool {
    dotenvy::dotenv().ok();
    std::env::var("ONEDRIVE_ACCESS_TOKEN").is_ok()
}
