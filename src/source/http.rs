//! Local HTTP fetch of remote URLs, used when the store cannot fetch a URL itself

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{StatusCode, header};
use std::time::Duration;

use super::{ByteStream, SourceStream};
use crate::error::{Error, FetchError, Result};
use crate::utils::url_filename;

/// A remote URL opened for streaming
pub struct HttpSource {
    /// Body bytes from the requested offset onward
    pub stream: ByteStream,
    /// Total object size, when the server declared it
    pub size: Option<u64>,
    /// Filename derived from the response headers and URL
    pub filename: String,
}

impl HttpSource {
    /// Drop the naming metadata and keep the stream
    pub fn into_stream(self) -> SourceStream {
        SourceStream {
            stream: self.stream,
            size: self.size,
        }
    }
}

/// Streaming HTTP client for remote URL sources
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Create a fetcher whose connection attempts give up after `connect_timeout`
    ///
    /// No overall request timeout is set; chunk reads are bounded by the reader instead.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// GET `url` starting at byte `offset`
    ///
    /// Resumes with a `Range` request. Servers that ignore the range and answer `200` have
    /// the first `offset` bytes discarded locally.
    pub async fn open(&self, url: &str, offset: u64) -> std::result::Result<HttpSource, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Read(format!("failed to fetch {url}: {e}"))
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::PermissionDenied(format!(
                    "{url} answered {}",
                    status.as_u16()
                )));
            }
            other => {
                return Err(FetchError::HttpStatus {
                    status: other.as_u16(),
                    url: url.to_string(),
                });
            }
        }

        let headers = response.headers();
        let content_disposition = header_str(headers, header::CONTENT_DISPOSITION);
        let content_type = header_str(headers, header::CONTENT_TYPE);
        let filename = url_filename(url, content_disposition.as_deref(), content_type.as_deref());

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let size = if partial {
            header_str(headers, header::CONTENT_RANGE).and_then(|v| total_from_content_range(&v))
        } else {
            response.content_length()
        };

        tracing::debug!(url, offset, ?size, partial, "opened remote URL");

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|e| FetchError::Read(e.to_string())))
            .boxed();
        let stream = if offset > 0 && !partial {
            skip_prefix(stream, offset)
        } else {
            stream
        };

        Ok(HttpSource {
            stream,
            size,
            filename,
        })
    }
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total from `Content-Range: bytes <start>-<end>/<total>`; `*` means unknown
fn total_from_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn skip_prefix(stream: ByteStream, mut remaining: u64) -> ByteStream {
    stream
        .filter_map(move |item| {
            let out = match item {
                Ok(mut bytes) => {
                    if remaining >= bytes.len() as u64 {
                        remaining -= bytes.len() as u64;
                        None
                    } else {
                        let rest: Bytes = bytes.split_off(remaining as usize);
                        remaining = 0;
                        Some(Ok(rest))
                    }
                }
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(out)
        })
        .boxed()
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.extend_from_slice(&item.unwrap());
        }
        out
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn streams_body_and_names_from_content_disposition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dl/123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Disposition", "attachment; filename=\"clip.mp4\"")
                    .set_body_bytes(b"0123456789".to_vec()),
            )
            .mount(&server)
            .await;

        let opened = fetcher()
            .open(&format!("{}/dl/123", server.uri()), 0)
            .await
            .unwrap();
        assert_eq!(opened.filename, "clip.mp4");
        assert_eq!(opened.size, Some(10));
        assert_eq!(read_all(opened.stream).await, b"0123456789");
    }

    #[tokio::test]
    async fn resumes_with_range_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header_eq("range", "bytes=4-"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 4-9/10")
                    .set_body_bytes(b"456789".to_vec()),
            )
            .mount(&server)
            .await;

        let opened = fetcher()
            .open(&format!("{}/file.bin", server.uri()), 4)
            .await
            .unwrap();
        assert_eq!(opened.size, Some(10));
        assert_eq!(read_all(opened.stream).await, b"456789");
    }

    #[tokio::test]
    async fn skips_prefix_when_server_ignores_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let opened = fetcher()
            .open(&format!("{}/file.bin", server.uri()), 6)
            .await
            .unwrap();
        assert_eq!(read_all(opened.stream).await, b"6789");
    }

    #[tokio::test]
    async fn not_found_is_a_non_retryable_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = fetcher()
            .open(&format!("{}/missing", server.uri()), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert!(!crate::retry::IsRetryable::is_retryable(&err));
    }

    #[tokio::test]
    async fn forbidden_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = fetcher()
            .open(&format!("{}/private", server.uri()), 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FetchError::PermissionDenied(_)));
    }

    #[test]
    fn content_range_total_parsing() {
        assert_eq!(total_from_content_range("bytes 0-9/10"), Some(10));
        assert_eq!(total_from_content_range("bytes 0-9/*"), None);
        assert_eq!(total_from_content_range("garbage"), None);
    }

    #[tokio::test]
    async fn skip_prefix_spans_multiple_blocks() {
        let items: Vec<std::result::Result<Bytes, FetchError>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"ghi")),
        ];
        let stream = skip_prefix(futures::stream::iter(items).boxed(), 4);
        assert_eq!(read_all(stream).await, b"efghi");
    }
}
