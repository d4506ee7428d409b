//! Status Reporter: one continuously edited message per job group
//!
//! Each open group gets a single-writer actor task owning its status message. Job snapshots
//! flow into the actor through a bounded channel; the actor folds them into the latest
//! [`GroupView`] and edits the message at most once per `edit_interval`, skipping edits
//! whose text would not change. Closing a group flushes the final state before the actor
//! exits.

mod render;
mod surface;

pub use render::{GroupView, format_bytes, render};
pub use surface::ConversationSurface;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::StatusConfig;
use crate::db::Database;
use crate::error::Result;
use crate::job::JobSnapshot;
use crate::types::{GroupId, MessageRef};

/// Everything needed to start reporting on a group
#[derive(Clone, Debug)]
pub struct GroupReport {
    /// Group ID
    pub group: GroupId,
    /// Message that triggered the request
    pub trigger: MessageRef,
    /// Status message from an earlier run, to edit instead of sending a new one
    pub status_message: Option<MessageRef>,
    /// Initial view
    pub view: GroupView,
}

struct GroupHandle {
    trigger: MessageRef,
    tx: mpsc::Sender<JobSnapshot>,
    task: JoinHandle<()>,
}

/// Projects job groups onto status messages
pub struct StatusReporter {
    surface: Arc<dyn ConversationSurface>,
    db: Arc<Database>,
    config: StatusConfig,
    groups: tokio::sync::Mutex<HashMap<GroupId, GroupHandle>>,
    /// Status messages of open groups, by trigger
    located: std::sync::RwLock<HashMap<MessageRef, MessageRef>>,
}

impl StatusReporter {
    /// Create a reporter writing through `surface`
    pub fn new(surface: Arc<dyn ConversationSurface>, db: Arc<Database>, config: StatusConfig) -> Self {
        Self {
            surface,
            db,
            config,
            groups: tokio::sync::Mutex::new(HashMap::new()),
            located: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// The conversation surface
    pub fn surface(&self) -> &Arc<dyn ConversationSurface> {
        &self.surface
    }

    /// Post (or adopt) the status message for a group and start its actor
    pub async fn open_group(&self, report: GroupReport) -> Result<MessageRef> {
        let GroupReport {
            group,
            trigger,
            status_message,
            view,
        } = report;
        let text = render(&view, self.config.max_listed_members);

        let status = match status_message {
            Some(existing) => {
                if let Err(e) = self.surface.edit_message(&existing, &text).await {
                    tracing::warn!(group_id = group.0, error = %e, "failed to refresh status message");
                }
                existing
            }
            None => {
                let sent = self
                    .surface
                    .send_message(&trigger.chat, Some(trigger.message_id), &text)
                    .await?;
                self.db.set_status_message(group, &sent).await?;
                sent
            }
        };

        self.located
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(trigger.clone(), status.clone());

        let (tx, rx) = mpsc::channel(self.config.update_buffer.max(1));
        let actor = GroupActor {
            surface: self.surface.clone(),
            status: status.clone(),
            group,
            view,
            last_text: text,
            max_listed: self.config.max_listed_members,
        };
        let task = tokio::spawn(actor.run(rx, self.config.edit_interval));

        let previous = self
            .groups
            .lock()
            .await
            .insert(group, GroupHandle { trigger, tx, task });
        if let Some(previous) = previous {
            drop(previous.tx);
            let _ = previous.task.await;
        }

        tracing::debug!(group_id = group.0, status = %status, "status message opened");
        Ok(status)
    }

    /// Queue a member snapshot for the group's next edit
    ///
    /// Waits when the group's buffer is full.
    pub async fn update(&self, group: GroupId, snapshot: JobSnapshot) {
        let tx = self.groups.lock().await.get(&group).map(|h| h.tx.clone());
        match tx {
            Some(tx) => {
                if tx.send(snapshot).await.is_err() {
                    tracing::debug!(group_id = group.0, "status actor already stopped");
                }
            }
            None => tracing::debug!(group_id = group.0, "status update for closed group"),
        }
    }

    /// Flush the final state of a group and stop its actor
    pub async fn close_group(&self, group: GroupId) {
        let handle = self.groups.lock().await.remove(&group);
        if let Some(handle) = handle {
            self.forget(&handle.trigger);
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                tracing::warn!(group_id = group.0, error = %e, "status actor panicked");
            }
        }
    }

    /// Apply the members' final snapshots, flush and stop the group's actor
    ///
    /// Returns false when the group had no running actor.
    pub async fn finish_group(&self, group: GroupId, members: Vec<JobSnapshot>) -> bool {
        let Some(handle) = self.groups.lock().await.remove(&group) else {
            return false;
        };
        self.forget(&handle.trigger);
        for snapshot in members {
            if handle.tx.send(snapshot).await.is_err() {
                break;
            }
        }
        drop(handle.tx);
        if let Err(e) = handle.task.await {
            tracing::warn!(group_id = group.0, error = %e, "status actor panicked");
        }
        true
    }

    /// Close every open group
    pub async fn close_all(&self) {
        let handles: Vec<(GroupId, GroupHandle)> = self.groups.lock().await.drain().collect();
        for (group, handle) in handles {
            self.forget(&handle.trigger);
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                tracing::warn!(group_id = group.0, error = %e, "status actor panicked");
            }
        }
    }

    /// Drop a closed group's trigger from the cache; `locate` then answers from the database
    fn forget(&self, trigger: &MessageRef) {
        self.located
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(trigger);
    }

    /// Whether the group still has a running actor
    pub async fn is_open(&self, group: GroupId) -> bool {
        self.groups.lock().await.contains_key(&group)
    }

    /// Status message reporting on the group `trigger` started
    pub async fn locate(&self, trigger: &MessageRef) -> Result<Option<MessageRef>> {
        let cached = self
            .located
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(trigger)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        let row = self.db.find_group_by_trigger(trigger).await?;
        Ok(row.and_then(|r| r.status_message()))
    }
}

struct GroupActor {
    surface: Arc<dyn ConversationSurface>,
    status: MessageRef,
    group: GroupId,
    view: GroupView,
    last_text: String,
    max_listed: usize,
}

impl GroupActor {
    async fn run(mut self, mut rx: mpsc::Receiver<JobSnapshot>, interval: std::time::Duration) {
        let mut ticker = tokio::time::interval(interval);
        // Delay keeps edits at least one interval apart after idle periods
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut dirty = false;
        loop {
            tokio::select! {
                update = rx.recv() => {
                    match update {
                        Some(snapshot) => dirty |= self.view.apply(snapshot),
                        None => break,
                    }
                }
                _ = ticker.tick(), if dirty => {
                    self.flush().await;
                    dirty = false;
                }
            }
        }

        if dirty {
            self.flush().await;
        }
        tracing::debug!(group_id = self.group.0, state = %self.view.state(), "status actor finished");
    }

    async fn flush(&mut self) {
        let text = render(&self.view, self.max_listed);
        if text == self.last_text {
            return;
        }
        match self.surface.edit_message(&self.status, &text).await {
            Ok(()) => self.last_text = text,
            Err(e) => {
                tracing::warn!(group_id = self.group.0, error = %e, "failed to edit status message")
            }
        }
    }
}
