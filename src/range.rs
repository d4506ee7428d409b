//! Range Expander
//!
//! Turns "`count` messages starting at `start`" into the ordered list of messages that
//! actually exist. Deleted ids are skipped; the walk ends early only at the end of the
//! channel or when the channel stops being readable.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::retry::with_retry;
use crate::source::ContentProxy;
use crate::types::MessageRef;

/// Hard boundary that cut a range short
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum RangeStop {
    /// Requested ids run past the newest message
    ChannelEnd,
    /// Channel became unreadable partway through
    PermissionLost(String),
}

impl fmt::Display for RangeStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeStop::ChannelEnd => f.write_str("reached the end of the channel"),
            RangeStop::PermissionLost(reason) => write!(f, "lost access to the channel: {reason}"),
        }
    }
}

/// Partial success: fewer messages admitted than requested
///
/// Reported alongside the admitted jobs, never as a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeExhausted {
    /// Messages found
    pub admitted: usize,
    /// Message ids asked for
    pub requested: usize,
    /// Boundary that stopped the walk, if it ended early
    pub boundary: Option<RangeStop>,
}

impl fmt::Display for RangeExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} admitted", self.admitted, self.requested)?;
        if let Some(boundary) = &self.boundary {
            write!(f, " ({boundary})")?;
        }
        Ok(())
    }
}

/// Result of expanding a range
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeExpansion {
    /// Existing messages in increasing id order
    pub messages: Vec<MessageRef>,
    /// Message ids asked for
    pub requested: usize,
    /// Boundary that stopped the walk early
    pub boundary: Option<RangeStop>,
}

impl RangeExpansion {
    /// Number of messages found
    pub fn admitted(&self) -> usize {
        self.messages.len()
    }

    /// The shortfall, when fewer messages were found than requested
    pub fn shortfall(&self) -> Option<RangeExhausted> {
        (self.admitted() < self.requested).then(|| RangeExhausted {
            admitted: self.admitted(),
            requested: self.requested,
            boundary: self.boundary.clone(),
        })
    }
}

/// Expand `count` message ids starting at `start` into existing messages
///
/// The proxy is queried `page_size` ids at a time; each page is retried on transient
/// errors. Errors other than the two hard boundaries propagate.
pub async fn expand_range(
    proxy: &dyn ContentProxy,
    start: &MessageRef,
    count: usize,
    page_size: usize,
    retry: &RetryConfig,
) -> Result<RangeExpansion, FetchError> {
    let page_size = page_size.max(1);
    let first = i64::from(start.message_id);
    let end = first.saturating_add(count as i64).min(i64::from(i32::MAX) + 1);

    let mut messages: Vec<MessageRef> = Vec::new();
    let mut boundary = None;
    let mut next = first;

    while next < end {
        let page = ((end - next) as usize).min(page_size);
        let page_start = next as i32;

        let result = with_retry(retry, || {
            proxy.resolve_message_range(&start.chat, page_start, page)
        })
        .await;

        match result {
            Ok(found) => {
                let page_end = next + page as i64;
                for message in found {
                    let id = i64::from(message.message_id);
                    let after_last = messages
                        .last()
                        .is_none_or(|last| message.message_id > last.message_id);
                    // Proxies may return neighbours outside the page; keep only what was asked
                    if message.chat == start.chat && id >= next && id < page_end && after_last {
                        messages.push(message);
                    }
                }
                next = page_end;
            }
            Err(FetchError::ChannelEnd) => {
                boundary = Some(RangeStop::ChannelEnd);
                break;
            }
            Err(FetchError::PermissionDenied(reason)) => {
                boundary = Some(RangeStop::PermissionLost(reason));
                break;
            }
            Err(e) => return Err(e),
        }
    }

    tracing::debug!(
        chat = %start.chat,
        start_id = start.message_id,
        requested = count,
        admitted = messages.len(),
        boundary = ?boundary,
        "range expanded"
    );

    Ok(RangeExpansion {
        messages,
        requested: count,
        boundary,
    })
}
