//! Waiting helpers and custom assertions for integration tests

use chat_relay::{Event, GroupId, GroupState, JobId, JobState, MessageRef, Relay};
use std::time::Duration;
use tokio::sync::broadcast;

/// Final counts of a finished group
#[derive(Debug, PartialEq, Eq)]
pub struct GroupOutcome {
    /// Aggregate state
    pub state: GroupState,
    /// Members that succeeded
    pub succeeded: usize,
    /// Total members
    pub total: usize,
}

/// Wait for `group` to finish
///
/// Subscribe before submitting, otherwise a quick group can finish unseen.
pub async fn wait_for_group(
    events: &mut broadcast::Receiver<Event>,
    group: GroupId,
    timeout: Duration,
) -> GroupOutcome {
    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::GroupFinished {
                    group: finished,
                    state,
                    succeeded,
                    total,
                }) if finished == group => {
                    return GroupOutcome {
                        state,
                        succeeded,
                        total,
                    };
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("group {group} did not finish within {timeout:?}"))
}

/// Collect events until `predicate` matches or the timeout expires
pub async fn collect_events_until<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: F,
) -> Vec<Event>
where
    F: FnMut(&Event) -> bool,
{
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = predicate(&event);
            collected.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    collected
}

/// Assert that a job is in the expected state
pub async fn assert_job_state(relay: &Relay, id: JobId, expected: JobState) {
    let job = relay
        .job(id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("job {id} not found"));
    assert_eq!(
        job.state, expected,
        "job {id}: expected {expected}, got {} (error: {:?})",
        job.state, job.error
    );
}

/// Text currently shown in the status message for `trigger`
pub async fn status_text(
    relay: &Relay,
    surface: &super::fixtures::RecordingSurface,
    trigger: &MessageRef,
) -> String {
    let outcome = relay
        .handle(chat_relay::Request::Locate {
            trigger: trigger.clone(),
        })
        .await
        .unwrap();
    let chat_relay::RequestOutcome::Located {
        status: Some(status),
    } = outcome
    else {
        panic!("no status message for {trigger}");
    };
    surface.text_of(&status).unwrap()
}

/// Committed byte counts of every progress event already delivered for `id`
pub fn drain_progress(events: &mut broadcast::Receiver<Event>, id: JobId) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(Event::Uploading {
                id: job,
                bytes_transferred,
                ..
            }) if job == id => seen.push(bytes_transferred),
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

/// Assert progress never decreases, never exceeds `size` and finishes at `size`
pub fn assert_progress_monotonic(progress: &[u64], size: u64) {
    assert!(!progress.is_empty(), "no progress events");
    for pair in progress.windows(2) {
        assert!(pair[0] <= pair[1], "progress decreased: {progress:?}");
    }
    assert!(
        progress.iter().all(|p| *p <= size),
        "progress beyond {size} bytes: {progress:?}"
    );
    assert_eq!(*progress.last().unwrap(), size);
}
