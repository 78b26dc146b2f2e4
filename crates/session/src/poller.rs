//! History poll fallback.
//!
//! While a session is Queued or Executing, a background task asks the
//! backend for the prompt's history entry at a fixed interval. It exits
//! on the first of: the controller cancels it, the session leaves
//! Queued/Executing, a result is found, or the optional watchdog
//! deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::controller::GenerationController;

/// Whether the poller should keep going after one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Done,
}

/// A running poller task.
pub struct PollerHandle {
    prompt_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollerHandle {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Signal the task to exit without waiting for it.
    ///
    /// Safe to call from inside the poller task itself.
    pub fn stop(self) {
        self.cancel.cancel();
    }

    /// Signal the task and wait up to `grace` for it to finish.
    pub async fn stop_and_wait(self, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.task).await.is_err() {
            tracing::warn!(prompt_id = %self.prompt_id, "Poller did not stop in time");
        }
    }
}

/// Start polling for `prompt_id`. The first poll happens one `interval`
/// after the call; the controller runs its own immediate check.
pub fn spawn(
    controller: Arc<GenerationController>,
    token: u64,
    prompt_id: String,
    interval: Duration,
    timeout: Option<Duration>,
) -> PollerHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task_prompt_id = prompt_id.clone();

    let task = tokio::spawn(async move {
        run(controller, token, &task_prompt_id, interval, timeout, &task_cancel).await;
        tracing::debug!(prompt_id = %task_prompt_id, "Poller exited");
    });

    PollerHandle {
        prompt_id,
        cancel,
        task,
    }
}

async fn run(
    controller: Arc<GenerationController>,
    token: u64,
    prompt_id: &str,
    interval: Duration,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                controller.expire(token, limit).await;
                return;
            }
        }

        if controller.poll_history(token, prompt_id).await == PollOutcome::Done {
            return;
        }
    }
}
