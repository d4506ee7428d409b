//! Conversational request handling.
//!
//! Every command the conversation surface can deliver is a [`Request`] variant; this module
//! turns each into admissions, cancellations or lookups.

use crate::db::NewJob;
use crate::error::{Error, FetchError, Result};
use crate::range::expand_range;
use crate::retry::with_retry;
use crate::types::{MessageRef, Request, RequestOutcome, Source};
use crate::utils::{destination_path, media_filename, parse_message_link, url_filename};

use super::Relay;

impl Relay {
    /// Handle one inbound request
    ///
    /// # Errors
    ///
    /// Admission requests fail with [`Error::ShuttingDown`] during shutdown, with
    /// [`Error::InvalidLink`] for unparseable links and with the fetch error when a source
    /// cannot be described. Fewer range messages than requested is not an error; the
    /// outcome carries both counts.
    pub async fn handle(&self, request: Request) -> Result<RequestOutcome> {
        match request {
            Request::Transfer {
                trigger,
                sources,
                directory,
            } => {
                if sources.is_empty() {
                    return Err(Error::Other("nothing to transfer".to_string()));
                }
                let requested = sources.len();
                let jobs = self
                    .resolve_jobs(sources, directory.as_deref(), false)
                    .await?;
                self.admit(trigger, requested, None, jobs).await
            }
            Request::Link {
                trigger,
                link,
                directory,
            } => {
                let message = parse_message_link(&link)?;
                let source = source_for(&trigger, message);
                let jobs = self
                    .resolve_jobs(vec![source], directory.as_deref(), false)
                    .await?;
                self.admit(trigger, 1, None, jobs).await
            }
            Request::Range {
                trigger,
                start,
                count,
                directory,
            } => {
                let max = self.config.transfer.max_range_count;
                if count == 0 || count > max {
                    return Err(Error::Other(format!(
                        "range must cover between 1 and {max} messages"
                    )));
                }
                let expansion = expand_range(
                    self.pipeline.sources.proxy().as_ref(),
                    &start,
                    count,
                    self.config.transfer.range_page_size,
                    &self.config.retry,
                )
                .await?;
                if let Some(shortfall) = expansion.shortfall() {
                    tracing::info!(start = %start, %shortfall, "range came up short");
                }

                let sources = expansion
                    .messages
                    .into_iter()
                    .map(|message| source_for(&trigger, message))
                    .collect();
                let jobs = self
                    .resolve_jobs(sources, directory.as_deref(), true)
                    .await?;
                self.admit(trigger, count, expansion.boundary, jobs).await
            }
            Request::Cancel { job } => {
                self.cancel(job).await?;
                Ok(RequestOutcome::Canceled { jobs: vec![job] })
            }
            Request::CancelAll => Ok(RequestOutcome::Canceled {
                jobs: self.cancel_all().await,
            }),
            Request::ToggleAutoDelete => Ok(RequestOutcome::AutoDelete {
                enabled: self.toggle_auto_delete().await?,
            }),
            Request::Locate { trigger } => Ok(RequestOutcome::Located {
                status: self.pipeline.reporter.locate(&trigger).await?,
            }),
        }
    }

    async fn admit(
        &self,
        trigger: MessageRef,
        requested: usize,
        boundary: Option<crate::range::RangeStop>,
        jobs: Vec<NewJob>,
    ) -> Result<RequestOutcome> {
        let admission = self
            .submit_group(trigger, requested, boundary.clone(), jobs)
            .await?;
        Ok(RequestOutcome::Admitted {
            group: admission.group,
            jobs: admission.jobs,
            requested,
            boundary,
        })
    }

    /// Name every source and resolve its destination path
    ///
    /// With `skip_missing`, messages that vanished or carry no media are left out instead
    /// of failing the request.
    async fn resolve_jobs(
        &self,
        sources: Vec<Source>,
        directory: Option<&str>,
        skip_missing: bool,
    ) -> Result<Vec<NewJob>> {
        let root = &self.config.transfer.destination_root;
        let mut jobs = Vec::with_capacity(sources.len());

        for source in sources {
            let filename = match self.source_filename(&source).await {
                Ok(name) => name,
                Err(e @ (FetchError::MessageNotFound(_) | FetchError::NoMedia(_)))
                    if skip_missing =>
                {
                    tracing::debug!(error = %e, "skipping message without media");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            jobs.push(NewJob {
                position: jobs.len(),
                destination_path: destination_path(root, directory, &filename),
                source,
            });
        }
        Ok(jobs)
    }

    async fn source_filename(&self, source: &Source) -> std::result::Result<String, FetchError> {
        match source {
            Source::RemoteUrl { url } => match self.pipeline.sources.http().open(url, 0).await {
                Ok(opened) => Ok(opened.filename),
                Err(e) => {
                    tracing::debug!(url, error = %e, "could not probe URL, naming it from the URL");
                    Ok(url_filename(url, None, None))
                }
            },
            other => {
                let Some(message) = other.media_message() else {
                    return Err(FetchError::NoMedia(other.kind().to_string()));
                };
                let proxy = self.pipeline.sources.proxy();
                let info = with_retry(&self.config.retry, || proxy.describe(&message)).await?;
                Ok(media_filename(&info))
            }
        }
    }
}

/// Messages in the triggering chat are read directly; anything else through the user session
fn source_for(trigger: &MessageRef, message: MessageRef) -> Source {
    if message.chat == trigger.chat {
        Source::ChatMedia { message }
    } else {
        Source::RestrictedLink {
            channel: message.chat,
            message_id: message.message_id,
        }
    }
}
