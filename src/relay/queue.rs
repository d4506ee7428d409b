//! Admission of job groups and the FIFO queue.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use crate::db::{NewGroup, NewJob};
use crate::error::{Error, JobError, Result};
use crate::job::Job;
use crate::range::RangeStop;
use crate::status::{GroupReport, GroupView};
use crate::types::{Event, GroupId, GroupState, JobId, JobState, MessageRef, Source};

use super::Relay;

/// Jobs admitted together as one group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    /// Group sharing one status message
    pub group: GroupId,
    /// Admitted jobs in order
    pub jobs: Vec<JobId>,
    /// Status message reporting on the group, when it could be sent
    pub status_message: Option<MessageRef>,
}

impl Relay {
    /// Admit one source as a single-job group
    ///
    /// The job waits in admission order until a worker slot is free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] once shutdown has started.
    pub async fn submit(
        &self,
        trigger: MessageRef,
        source: Source,
        destination_path: impl Into<String>,
    ) -> Result<JobId> {
        let admission = self
            .submit_group(
                trigger,
                1,
                None,
                vec![NewJob {
                    position: 0,
                    source,
                    destination_path: destination_path.into(),
                }],
            )
            .await?;
        admission
            .jobs
            .first()
            .copied()
            .ok_or_else(|| Error::Other("admission produced no job".to_string()))
    }

    /// Admit `jobs` as one group reporting through a single status message
    ///
    /// `requested` is how many sources were asked for and `boundary` what stopped a range
    /// short; both only affect the status summary. The group and its jobs are persisted in
    /// one transaction before any job is queued.
    pub async fn submit_group(
        &self,
        trigger: MessageRef,
        requested: usize,
        boundary: Option<RangeStop>,
        jobs: Vec<NewJob>,
    ) -> Result<Admission> {
        if !self.queue_state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let new_group = NewGroup {
            trigger: trigger.clone(),
            requested,
            boundary: boundary.clone(),
        };
        let (group, ids) = self.db.insert_group_with_jobs(&new_group, &jobs).await?;

        let members: Vec<_> = ids
            .iter()
            .zip(&jobs)
            .map(|(id, new)| {
                Job::new(
                    *id,
                    group,
                    new.position,
                    new.source.clone(),
                    new.destination_path.clone(),
                )
                .snapshot()
            })
            .collect();

        for (id, new) in ids.iter().zip(&jobs) {
            tracing::info!(
                job_id = id.0,
                group_id = group.0,
                source = new.source.kind(),
                destination = %new.destination_path,
                "job admitted"
            );
            self.emit_event(Event::Queued {
                id: *id,
                group,
                destination: new.destination_path.clone(),
            });
        }

        // Open the status message before any worker can report on the group
        let report = GroupReport {
            group,
            trigger,
            status_message: None,
            view: GroupView {
                members,
                requested,
                boundary,
            },
        };
        let status_message = match self.pipeline.reporter.open_group(report).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(group_id = group.0, error = %e, "failed to post status message");
                None
            }
        };

        {
            let mut queue = self.queue_state.queue.lock().await;
            queue.extend(ids.iter().copied());
        }
        self.queue_state.queue_notify.notify_one();

        if ids.is_empty() {
            self.complete_group_if_finished(group).await;
        }

        Ok(Admission {
            group,
            jobs: ids,
            status_message,
        })
    }

    /// Remove a job from the queue without starting it
    ///
    /// Returns true if the job was waiting in the queue.
    pub(crate) async fn remove_from_queue(&self, id: JobId) -> bool {
        let mut queue = self.queue_state.queue.lock().await;
        match queue.iter().position(|queued| *queued == id) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Jobs waiting for a worker, in dispatch order
    pub async fn queued_jobs(&self) -> Vec<JobId> {
        self.queue_state.queue.lock().await.iter().copied().collect()
    }

    /// Restore unfinished jobs from the database on startup
    ///
    /// Called automatically during initialization. Jobs that were queued or mid-transfer
    /// when the previous run stopped are put back in the queue in admission order, keeping
    /// their upload session so the transfer resumes from the committed range. Rows whose
    /// source can no longer be decoded are marked failed and reported as dropped. Status
    /// messages of the affected groups are refreshed in place.
    pub async fn restore_queue(&self) -> Result<usize> {
        let rows = self.db.list_unfinished_jobs().await?;
        if rows.is_empty() {
            tracing::debug!("no unfinished jobs to restore");
            return Ok(0);
        }

        tracing::info!(count = rows.len(), "restoring unfinished jobs");

        let mut groups = BTreeSet::new();
        let mut restored = Vec::with_capacity(rows.len());

        for row in rows {
            let id = JobId(row.id);
            groups.insert(GroupId(row.group_id));

            match Job::try_from(row) {
                Ok(mut job) => {
                    if job.state() != JobState::Queued {
                        tracing::info!(
                            job_id = id.0,
                            state = %job.state(),
                            committed = job.bytes_transferred(),
                            "resuming interrupted job"
                        );
                        job.requeue()?;
                        self.db.save_job(&job).await?;
                    }
                    restored.push(id);
                }
                Err(e) => {
                    let reason = format!("dropped on restart: {e}");
                    tracing::warn!(job_id = id.0, error = %e, "queued job cannot be re-admitted");
                    self.db.mark_job_dropped(id, &reason).await?;
                    self.emit_event(Event::Dropped { id, reason });
                }
            }
        }

        let count = restored.len();
        self.queue_state.queue.lock().await.extend(restored);
        self.queue_state.queue_notify.notify_one();

        for group in groups {
            if let Err(e) = self.reopen_group_status(group).await {
                tracing::warn!(group_id = group.0, error = %e, "failed to restore status message");
            }
            self.complete_group_if_finished(group).await;
        }

        tracing::info!(restored = count, "queue restoration complete");
        Ok(count)
    }

    async fn reopen_group_status(&self, group: GroupId) -> Result<()> {
        let row = self
            .db
            .get_group(group)
            .await?
            .ok_or(JobError::GroupNotFound { id: group })?;
        let trigger = row
            .trigger()
            .ok_or_else(|| Error::Other(format!("group {group} has an invalid trigger")))?;

        let members = self.group_snapshots(group).await?;
        let report = GroupReport {
            group,
            trigger,
            status_message: row.status_message(),
            view: GroupView {
                members,
                requested: row.requested.max(0) as usize,
                boundary: row.boundary(),
            },
        };
        self.pipeline.reporter.open_group(report).await?;
        Ok(())
    }

    /// Announce a group whose members are all terminal, exactly once
    ///
    /// The final status is rendered from the persisted records so every member's last
    /// state shows, whichever worker finishes last.
    pub(crate) async fn complete_group_if_finished(&self, group: GroupId) {
        let members = match self.group_snapshots(group).await {
            Ok(members) => members,
            Err(e) => {
                tracing::error!(group_id = group.0, error = %e, "failed to load group members");
                return;
            }
        };
        if !members.iter().all(|m| m.state.is_terminal()) {
            return;
        }
        match self.db.claim_group_finished(group).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::error!(group_id = group.0, error = %e, "failed to mark group finished");
                return;
            }
        }

        let state = GroupState::aggregate(members.iter().map(|m| &m.state));
        let succeeded = members
            .iter()
            .filter(|m| m.state == JobState::Succeeded)
            .count();
        let total = members.len();

        self.pipeline.reporter.finish_group(group, members).await;

        tracing::info!(group_id = group.0, %state, succeeded, total, "group finished");
        self.emit_event(Event::GroupFinished {
            group,
            state,
            succeeded,
            total,
        });
    }
}
