//! Job task execution: one job's transfer from source to store.
//!
//! Split into focused submodules:
//! - [`context`] - Shared state and persist/emit/report helpers
//! - [`orchestration`] - Top-level job lifecycle and outcome recording
//! - [`remote_url`] - Store-side URL fetch with local fallback
//! - [`upload`] - Chunked streaming through a resumable upload session

mod context;
mod orchestration;
mod remote_url;
mod upload;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub(crate) use context::JobTaskContext;
pub(crate) use orchestration::run_job_task;
