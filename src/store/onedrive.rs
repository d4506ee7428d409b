//! OneDrive backend over the Microsoft Graph resumable upload API
//!
//! - `POST {drive}/root:{path}:/createUploadSession` opens a session and returns an upload URL
//! - `PUT {uploadUrl}` with `Content-Range` sends one range; `202` means more is expected,
//!   `200`/`201` carries the finished item
//! - `GET {uploadUrl}` reports `nextExpectedRanges`; `DELETE {uploadUrl}` discards the session
//! - `POST {drive}/root:{parent}:/children` with `@microsoft.graph.sourceUrl` and
//!   `Prefer: respond-async` asks the drive to fetch a URL itself; progress is polled from the
//!   monitor URL in the `Location` header
//!
//! Upload and monitor URLs are pre-authorized and must not carry the bearer token.

use bytes::Bytes;
use reqwest::{StatusCode, header};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{CommittedRange, DestinationStore, PutOutcome, UploadSessionToken};
use crate::config::{ConflictBehavior, ONEDRIVE_MAX_CHUNK, ONEDRIVE_QUANTUM, OneDriveConfig};
use crate::error::{Error, Result, StoreError, StoreRejection};
use crate::types::ObjectDescriptor;

/// Source of Graph access tokens
///
/// Token acquisition and refresh belong to the embedding application.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// A currently valid bearer token
    async fn access_token(&self) -> std::result::Result<String, StoreError>;
}

/// A fixed access token
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> std::result::Result<String, StoreError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct UploadSessionResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

#[derive(Deserialize)]
struct UploadStatusResponse {
    #[serde(rename = "nextExpectedRanges", default)]
    next_expected_ranges: Vec<String>,
}

#[derive(Deserialize)]
struct ParentReference {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "parentReference", default)]
    parent_reference: Option<ParentReference>,
}

#[derive(Deserialize)]
struct MonitorStatus {
    status: String,
    #[serde(rename = "percentageComplete", default)]
    percentage_complete: Option<f64>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Deserialize)]
struct GraphError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// Which kind of URL a failing request targeted
#[derive(Clone, Copy)]
enum Target<'a> {
    /// A pre-authorized upload URL; 404 means the session is gone
    Session,
    /// A drive item at this path
    Item(&'a str),
}

/// [`DestinationStore`] backed by OneDrive
pub struct OneDriveStore {
    client: reqwest::Client,
    config: OneDriveConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl OneDriveStore {
    /// Create a store using `tokens` for authorization
    pub fn new(config: OneDriveConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            tokens,
        })
    }

    /// `{base}/{drive}/root:{path}` followed by `suffix`
    fn item_url(&self, path: &str, suffix: &str) -> String {
        format!(
            "{}/{}/root:{}{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.drive.trim_matches('/'),
            encode_path(path),
            suffix
        )
    }

    async fn bearer(&self) -> std::result::Result<String, StoreError> {
        Ok(format!("Bearer {}", self.tokens.access_token().await?))
    }

    async fn fetch_item(&self, path: &str) -> std::result::Result<ObjectDescriptor, StoreError> {
        let response = self
            .client
            .get(self.item_url(path, ""))
            .header(header::AUTHORIZATION, self.bearer().await?)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response, Target::Item(path)).await);
        }
        let item: DriveItem = response.json().await.map_err(decode_error)?;
        Ok(descriptor_from_item(item))
    }

    async fn wait_for_monitor(
        &self,
        monitor_url: &str,
        path: &str,
    ) -> std::result::Result<ObjectDescriptor, StoreError> {
        loop {
            let response = self
                .client
                .get(monitor_url)
                .send()
                .await
                .map_err(transport_error)?;
            let status = response.status();

            // The monitor redirects to the finished item
            if status == StatusCode::SEE_OTHER {
                return self.fetch_item(path).await;
            }
            if !status.is_success() {
                return Err(error_from_response(response, Target::Item(path)).await);
            }

            let progress: MonitorStatus = response.json().await.map_err(decode_error)?;
            match progress.status.as_str() {
                "completed" => return self.fetch_item(path).await,
                "failed" | "cancelled" | "deleteFailed" => {
                    let reason = progress
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| progress.status.clone());
                    return Err(StoreError::Rejected(StoreRejection::InvalidRequest(
                        format!("remote fetch {reason}"),
                    )));
                }
                _ => {
                    tracing::debug!(
                        path,
                        status = %progress.status,
                        percent = progress.percentage_complete,
                        "remote fetch in progress"
                    );
                    tokio::time::sleep(self.config.monitor_poll_interval).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl DestinationStore for OneDriveStore {
    fn name(&self) -> &str {
        "onedrive"
    }

    fn quantum(&self) -> usize {
        ONEDRIVE_QUANTUM
    }

    fn max_chunk_size(&self) -> usize {
        ONEDRIVE_MAX_CHUNK
    }

    async fn create_upload_session(
        &self,
        path: &str,
        size_hint: Option<u64>,
    ) -> std::result::Result<UploadSessionToken, StoreError> {
        let mut item = json!({
            "@microsoft.graph.conflictBehavior": self.config.conflict_behavior.as_graph_value(),
        });
        if let Some(size) = size_hint {
            item["fileSize"] = json!(size);
        }

        let response = self
            .client
            .post(self.item_url(path, ":/createUploadSession"))
            .header(header::AUTHORIZATION, self.bearer().await?)
            .json(&json!({ "item": item }))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response, Target::Item(path)).await);
        }

        let session: UploadSessionResponse = response.json().await.map_err(decode_error)?;
        Ok(UploadSessionToken(session.upload_url))
    }

    async fn query_committed_range(
        &self,
        token: &UploadSessionToken,
    ) -> std::result::Result<CommittedRange, StoreError> {
        let response = self
            .client
            .get(token.as_str())
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(error_from_response(response, Target::Session).await);
        }
        let status: UploadStatusResponse = response.json().await.map_err(decode_error)?;
        let end = status
            .next_expected_ranges
            .first()
            .and_then(|range| range_start(range))
            .ok_or_else(|| {
                StoreError::Protocol(format!(
                    "unexpected nextExpectedRanges {:?}",
                    status.next_expected_ranges
                ))
            })?;
        Ok(CommittedRange { start: 0, end })
    }

    async fn put_range(
        &self,
        token: &UploadSessionToken,
        data: Bytes,
        offset: u64,
        total: Option<u64>,
    ) -> std::result::Result<PutOutcome, StoreError> {
        let len = data.len() as u64;
        if len == 0 {
            return Err(StoreError::Protocol("empty range".to_string()));
        }
        let content_range = content_range(offset, len, total);

        let response = self
            .client
            .put(token.as_str())
            .header(header::CONTENT_LENGTH, len)
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::ACCEPTED => {
                let status: UploadStatusResponse = response.json().await.map_err(decode_error)?;
                Ok(PutOutcome::Accepted {
                    next_expected: status
                        .next_expected_ranges
                        .first()
                        .and_then(|range| range_start(range)),
                })
            }
            StatusCode::OK | StatusCode::CREATED => {
                let item: DriveItem = response.json().await.map_err(decode_error)?;
                Ok(PutOutcome::Completed(descriptor_from_item(item)))
            }
            _ => Err(error_from_response(response, Target::Session).await),
        }
    }

    /// Graph hands the item back on the final range; this only runs when that answer was lost
    ///
    /// A live session means bytes are still missing. A gone session means the upload either
    /// finished or expired; the item at `path` identifies it only when the drive never
    /// renames, so under `rename` the session counts as lost.
    async fn complete(
        &self,
        token: &UploadSessionToken,
        path: &str,
    ) -> std::result::Result<ObjectDescriptor, StoreError> {
        match self.query_committed_range(token).await {
            Ok(range) => {
                return Err(StoreError::Protocol(format!(
                    "{path}: upload still expects bytes from offset {}",
                    range.end
                )));
            }
            Err(StoreError::SessionLost) => {}
            Err(e) => return Err(e),
        }

        match self.config.conflict_behavior {
            ConflictBehavior::Replace | ConflictBehavior::Fail => self.fetch_item(path).await,
            ConflictBehavior::Rename => {
                tracing::warn!(
                    path,
                    "upload session closed without confirmation; an item at this path may be older"
                );
                Err(StoreError::SessionLost)
            }
        }
    }

    async fn abort(&self, token: &UploadSessionToken) -> std::result::Result<(), StoreError> {
        let response = self
            .client
            .delete(token.as_str())
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            _ => Err(error_from_response(response, Target::Session).await),
        }
    }

    async fn fetch_by_url(
        &self,
        path: &str,
        url: &str,
    ) -> std::result::Result<ObjectDescriptor, StoreError> {
        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) if !name.is_empty() => (parent, name),
            _ => {
                return Err(StoreError::Rejected(StoreRejection::InvalidRequest(
                    format!("not a file path: {path}"),
                )));
            }
        };
        let children_url = if parent.is_empty() {
            format!(
                "{}/{}/root/children",
                self.config.api_base.trim_end_matches('/'),
                self.config.drive.trim_matches('/')
            )
        } else {
            self.item_url(parent, ":/children")
        };

        let response = self
            .client
            .post(children_url)
            .header(header::AUTHORIZATION, self.bearer().await?)
            .header("Prefer", "respond-async")
            .json(&json!({
                "@microsoft.graph.sourceUrl": url,
                "name": name,
                "file": {},
                "@microsoft.graph.conflictBehavior": self.config.conflict_behavior.as_graph_value(),
            }))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(error_from_response(response, Target::Item(path)).await);
        }
        let monitor_url = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Protocol("remote fetch accepted without monitor".into()))?;

        self.wait_for_monitor(&monitor_url, path).await
    }
}

/// Percent-encode each segment of a drive path, keeping the separators
fn encode_path(path: &str) -> String {
    let mut out = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(&urlencoding::encode(segment));
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// `bytes <start>-<end>/<total>` with an inclusive end; unknown totals are `*`
fn content_range(offset: u64, len: u64, total: Option<u64>) -> String {
    let total = total.map_or_else(|| "*".to_string(), |t| t.to_string());
    format!("bytes {}-{}/{}", offset, offset + len - 1, total)
}

/// Start offset of a `nextExpectedRanges` entry such as `"12345-"` or `"0-99"`
fn range_start(range: &str) -> Option<u64> {
    range.split('-').next()?.trim().parse().ok()
}

fn descriptor_from_item(item: DriveItem) -> ObjectDescriptor {
    let parent = item
        .parent_reference
        .and_then(|p| p.path)
        .map(|p| match p.split_once("root:") {
            Some((_, rest)) => rest.to_string(),
            None => p,
        })
        .unwrap_or_default();
    let parent = urlencoding::decode(&parent)
        .map(|s| s.into_owned())
        .unwrap_or(parent);
    ObjectDescriptor {
        id: item.id,
        path: format!("{}/{}", parent.trim_end_matches('/'), item.name),
        size: item.size,
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::ChunkSend(e.to_string())
    }
}

fn decode_error(e: reqwest::Error) -> StoreError {
    StoreError::Protocol(format!("failed to decode Graph response: {e}"))
}

async fn error_from_response(response: reqwest::Response, target: Target<'_>) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<GraphErrorBody>(&body) {
        Ok(parsed) => (parsed.error.code, parsed.error.message),
        Err(_) => (String::new(), body),
    };
    let detail = if code.is_empty() {
        format!("{}: {}", status.as_u16(), message)
    } else {
        format!("{} {}: {}", status.as_u16(), code, message)
    };

    match status.as_u16() {
        401 => StoreError::Rejected(StoreRejection::AuthExpired(detail)),
        403 if code == "quotaLimitReached" => {
            StoreError::Rejected(StoreRejection::QuotaExceeded(detail))
        }
        507 => StoreError::Rejected(StoreRejection::QuotaExceeded(detail)),
        404 => match target {
            Target::Session => StoreError::SessionLost,
            Target::Item(_) => StoreError::Rejected(StoreRejection::InvalidRequest(detail)),
        },
        409 => match target {
            Target::Item(path) => StoreError::Rejected(StoreRejection::PathConflict(path.to_string())),
            Target::Session => StoreError::Rejected(StoreRejection::PathConflict(detail)),
        },
        416 => StoreError::Protocol(detail),
        408 | 429 | 500..=599 => StoreError::ChunkSend(detail),
        _ => StoreError::Rejected(StoreRejection::InvalidRequest(detail)),
    }
}
