//! Push-channel supervision.
//!
//! One [`PushChannel`] per backend address: a task that connects,
//! forwards frames to the controller in arrival order, and reconnects
//! with backoff when the socket drops. Replacing the address means
//! [`close`](PushChannel::close) on the old channel, which waits until
//! its task and dispatcher have exited, before opening the new one.

use std::sync::Arc;
use std::time::Duration;

use studio_comfyui::client::ComfyUIClient;
use studio_comfyui::processor::{process_messages, StreamEnd};
use studio_comfyui::reconnect::{connect_with_backoff, Backoff};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controller::GenerationController;
use crate::events::SessionEvent;

/// How long [`PushChannel::close`] waits for the task.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub struct PushChannel {
    server_url: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PushChannel {
    /// Spawn the connection task for `server_url`.
    pub fn open(server_url: &str, controller: Arc<GenerationController>) -> Self {
        let client = ComfyUIClient::new(server_url, controller.client_id());
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let server = server_url.to_string();

        let task = tokio::spawn(async move {
            tracing::info!(server = %server, "Starting push channel");
            run_channel(&client, &server, controller, &task_cancel).await;
            tracing::info!(server = %server, "Push channel exited");
        });

        Self {
            server_url: server_url.to_string(),
            cancel,
            task,
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Close the socket and wait for every queued message to be handled.
    ///
    /// A task still running after the grace period is aborted, so it can
    /// never overlap the channel that replaces it.
    pub async fn close(self) {
        self.cancel.cancel();
        stop_task(self.task, CLOSE_GRACE, &self.server_url).await;
    }
}

async fn stop_task(mut task: JoinHandle<()>, grace: Duration, server: &str) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        tracing::warn!(server = %server, "Push channel did not close in time, aborting");
        task.abort();
        // Wait for the abort to land; the result is always a cancellation.
        let _ = task.await;
    }
}

/// Connect -> forward messages -> reconnect, until cancelled.
async fn run_channel(
    client: &ComfyUIClient,
    server: &str,
    controller: Arc<GenerationController>,
    cancel: &CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let dispatch_controller = Arc::clone(&controller);
    let dispatcher = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            dispatch_controller.handle_message(msg).await;
        }
    });

    let mut backoff = Backoff::default();
    while let Some(mut conn) = connect_with_backoff(client, &mut backoff, cancel).await {
        controller.publish(SessionEvent::Connected {
            server: server.to_string(),
        });

        let end = tokio::select! {
            _ = cancel.cancelled() => None,
            end = process_messages(&mut conn.ws_stream, &tx) => Some(end),
        };

        match end {
            None => {
                conn.close().await;
                controller.publish(SessionEvent::Disconnected {
                    server: server.to_string(),
                });
                break;
            }
            Some(StreamEnd::ConsumerGone) => {
                tracing::error!(server = %server, "Message dispatcher stopped");
                break;
            }
            Some(StreamEnd::Disconnected) => {
                tracing::info!(server = %server, "Connection lost, reconnecting");
                controller.publish(SessionEvent::Disconnected {
                    server: server.to_string(),
                });
            }
        }
    }

    drop(tx);
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "Message dispatcher panicked");
    }
}
