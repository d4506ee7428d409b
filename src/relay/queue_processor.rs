//! Queue processor: dispatches queued jobs to workers within the concurrency bound.

use std::time::Duration;

use super::Relay;
use super::job_task::{JobTaskContext, run_job_task};

/// Fallback poll interval in case a wake-up was missed
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl Relay {
    /// Start the queue processor task
    ///
    /// This method spawns a background task that continuously:
    /// 1. Acquires a permit from the concurrency limiter (respects max_concurrent_jobs)
    /// 2. Takes the oldest job from the queue, waiting for admissions when it is empty
    /// 3. Spawns a worker task that owns that job until it is terminal
    /// 4. Repeats until shutdown
    ///
    /// The permit is taken before the job so a job only leaves the queue when a worker can
    /// start it; with `k > m` admissions exactly `m` jobs are active and the rest stay queued
    /// in admission order.
    pub fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let relay = self.clone();

        tokio::spawn(async move {
            let shutdown = relay.queue_state.shutdown.clone();
            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = relay.queue_state.concurrent_limit.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    // Semaphore closed
                    break;
                };

                // The job moves from the queue to the active map under the queue lock, so a
                // concurrent cancel always finds it in one of the two
                let next = loop {
                    {
                        let mut queue = relay.queue_state.queue.lock().await;
                        if let Some(id) = queue.pop_front() {
                            let cancel_token = shutdown.child_token();
                            relay
                                .queue_state
                                .active_jobs
                                .lock()
                                .await
                                .insert(id, cancel_token.clone());
                            break Some((id, cancel_token));
                        }
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break None,
                        _ = relay.queue_state.queue_notify.notified() => {}
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => {}
                    }
                };
                let Some((id, cancel_token)) = next else {
                    break;
                };

                tracing::debug!(job_id = id.0, "dispatching job");

                let ctx = JobTaskContext {
                    id,
                    relay: relay.clone(),
                    cancel_token,
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    run_job_task(ctx).await;
                });
            }
            tracing::debug!("queue processor stopped");
        })
    }
}
