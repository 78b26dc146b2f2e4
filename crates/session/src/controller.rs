//! Generation orchestration.
//!
//! [`GenerationController`] drives one submission end to end:
//! sequential uploads, graph build, submit, then three independent
//! completion producers (push messages, the history poller and one
//! immediate history check) that all funnel into
//! [`GenerationController::complete`]. The reconciler decides; this
//! module performs the I/O and publishes [`SessionEvent`]s.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use studio_comfyui::messages::ComfyUIMessage;
use studio_core::builder::{build_job_graph, preflight};
use studio_core::history::HistoryRecord;
use studio_core::params::{GenerationParameters, ImageRef};
use studio_core::resolver::{history_entry, resolve_artifact, ArtifactRef};
use studio_core::templates::WorkflowTemplateStore;
use studio_core::types::now_millis;
use studio_core::StudioError;
use tokio::sync::{broadcast, Mutex};

use crate::events::SessionEvent;
use crate::handle::BackendHandle;
use crate::history::SessionHistoryStore;
use crate::poller::{self, PollOutcome, PollerHandle};
use crate::reconciler::{
    CompletionReconciler, GenerationSession, GenerationSnapshot, GenerationStatus, QueueOutcome,
    Reaction, SessionStart,
};

/// Default history poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts to read the history entry after a push completion signal;
/// the backend can announce success before the entry is written.
const HISTORY_FETCH_ATTEMPTS: u32 = 3;
const HISTORY_FETCH_DELAY: Duration = Duration::from_millis(500);

/// Grace period for the poller task on shutdown.
const POLLER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct GenerationController {
    backend: BackendHandle,
    templates: WorkflowTemplateStore,
    history: SessionHistoryStore,
    state: Mutex<CompletionReconciler>,
    poller: Mutex<Option<PollerHandle>>,
    events: broadcast::Sender<SessionEvent>,
    /// Sent with every submission; the push channel uses the same ID.
    client_id: String,
    poll_interval: Duration,
    execution_timeout: Option<Duration>,
}

impl GenerationController {
    pub fn new(
        backend: BackendHandle,
        templates: WorkflowTemplateStore,
        history: SessionHistoryStore,
        client_id: impl Into<String>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            backend,
            templates,
            history,
            state: Mutex::new(CompletionReconciler::new()),
            poller: Mutex::new(None),
            events,
            client_id: client_id.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            execution_timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn history(&self) -> &SessionHistoryStore {
        &self.history
    }

    pub fn templates(&self) -> &WorkflowTemplateStore {
        &self.templates
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> GenerationSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Start a generation. Returns the backend prompt ID once queued.
    ///
    /// Completion arrives later through [`SessionEvent`]s. Any error is
    /// also recorded on the session before being returned.
    pub async fn submit(
        self: &Arc<Self>,
        params: GenerationParameters,
    ) -> Result<String, StudioError> {
        let token = self.state.lock().await.begin(SessionStart {
            mode: params.mode,
            extend: params.extend_requested(),
            prompt: params.prompt.clone(),
            seed: params.seed,
            submitted_at: now_millis(),
        })?;
        self.publish(SessionEvent::StatusChanged {
            status: GenerationStatus::Uploading,
            prompt_id: None,
        });
        tracing::info!(mode = %params.mode, token, "Generation started");

        let (prompt_id, filenames) = match self.upload_and_submit(&params).await {
            Ok(submitted) => submitted,
            Err(e) => {
                self.fail(token, &e).await;
                return Err(e);
            }
        };

        let outcome = self
            .state
            .lock()
            .await
            .mark_queued(token, &prompt_id, filenames.into_iter().next());

        match outcome {
            QueueOutcome::Superseded => {
                tracing::warn!(prompt_id = %prompt_id, "Session ended before the prompt was queued");
                // The interrupt went out before /prompt; this prompt is still live.
                let backend = self.backend.current().await;
                if let Err(e) = backend.cancel_prompt(&prompt_id).await {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "Failed to cancel orphaned prompt");
                }
                return Err(StudioError::Validation(
                    "Generation was cancelled before it was queued".to_string(),
                ));
            }
            QueueOutcome::AlreadyFinished => {
                tracing::info!(prompt_id = %prompt_id, "Success arrived before submit returned");
                self.complete(&prompt_id, None).await;
            }
            QueueOutcome::Queued => {
                self.publish(SessionEvent::StatusChanged {
                    status: GenerationStatus::Queued,
                    prompt_id: Some(prompt_id.clone()),
                });
                self.start_poller(token, &prompt_id).await;
                // Cached graphs can finish before any listener is ready.
                self.poll_history(token, &prompt_id).await;
            }
        }

        Ok(prompt_id)
    }

    /// Feed one push-channel message.
    pub async fn handle_message(self: &Arc<Self>, msg: ComfyUIMessage) {
        let reaction = self.state.lock().await.apply(&msg);
        match reaction {
            Reaction::Ignored => {}
            Reaction::Updated(events) => {
                for event in events {
                    self.publish(event);
                }
            }
            Reaction::Complete(prompt_id) => self.complete(&prompt_id, None).await,
            Reaction::Failed(message) => {
                self.stop_poller().await;
                let prompt_id = msg.prompt_id().map(str::to_string);
                tracing::warn!(prompt_id = ?prompt_id, error = %message, "Generation failed");
                self.publish(SessionEvent::StatusChanged {
                    status: GenerationStatus::Error,
                    prompt_id: prompt_id.clone(),
                });
                self.publish(SessionEvent::Failed { prompt_id, message });
            }
        }
    }

    /// The single completion entry point shared by every producer.
    ///
    /// `entry` is the history entry when the caller already has it.
    /// Repeat calls for the same prompt are no-ops.
    pub async fn complete(self: &Arc<Self>, prompt_id: &str, entry: Option<serde_json::Value>) {
        let claimed = self.state.lock().await.claim(prompt_id);
        let Some(session) = claimed else {
            tracing::debug!(prompt_id, "Completion already handled or not active");
            return;
        };

        self.stop_poller().await;
        self.publish(SessionEvent::StatusChanged {
            status: GenerationStatus::Finished,
            prompt_id: Some(prompt_id.to_string()),
        });
        tracing::info!(prompt_id, "Generation finished");

        let artifact = match self.locate_artifact(&session, prompt_id, entry).await {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Could not retrieve generated output");
                let message = {
                    let mut state = self.state.lock().await;
                    state.retrieval_failed(session.token, &e);
                    state.snapshot().message
                };
                self.publish(SessionEvent::Failed {
                    prompt_id: Some(prompt_id.to_string()),
                    message: message.unwrap_or_else(|| e.user_message()),
                });
                return;
            }
        };

        let record = HistoryRecord::from_artifact(
            prompt_id,
            &artifact,
            session.mode,
            &session.prompt,
            session.seed,
            session.input_filename.clone(),
            session.submitted_at,
            now_millis(),
        );

        let attached = self
            .state
            .lock()
            .await
            .attach_result(session.token, record.clone());
        if !attached {
            tracing::debug!(prompt_id, "Result already recorded");
            return;
        }

        let entry = match self.history.append(&record).await {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "Failed to save history record");
                self.state.lock().await.note(
                    session.token,
                    format!("Generated, but saving history failed: {}", e.user_message()),
                );
                match self.history.entry_for(record).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(prompt_id, error = %e, "Cannot build media URL");
                        return;
                    }
                }
            }
        };
        self.publish(SessionEvent::Finished { entry });
    }

    /// Cancel on the backend, then reset to Idle regardless of the
    /// backend's answer.
    pub async fn interrupt(&self) {
        let backend = self.backend.current().await;
        if let Err(e) = backend.interrupt().await {
            tracing::warn!(error = %e, "Interrupt request failed");
        }

        let prompt_id = self.state.lock().await.interrupt();
        self.stop_poller().await;
        tracing::info!(prompt_id = ?prompt_id, "Generation interrupted");
        self.publish(SessionEvent::StatusChanged {
            status: GenerationStatus::Idle,
            prompt_id,
        });
    }

    /// Ask the backend to unload models and free memory. Failures are
    /// logged and otherwise ignored.
    pub async fn free_memory(&self) {
        let backend = self.backend.current().await;
        match backend.free_memory(true, true).await {
            Ok(()) => tracing::info!("Backend memory freed"),
            Err(e) => tracing::warn!(error = %e, "Free memory request failed"),
        }
    }

    /// Stop the poller and wait for it.
    pub async fn shutdown(&self) {
        let handle = self.poller.lock().await.take();
        if let Some(handle) = handle {
            handle.stop_and_wait(POLLER_SHUTDOWN_GRACE).await;
        }
    }

    // ---- poller callbacks ----

    /// One history check for the active prompt.
    pub(crate) async fn poll_history(self: &Arc<Self>, token: u64, prompt_id: &str) -> PollOutcome {
        if !self.state.lock().await.is_polling(token, prompt_id) {
            return PollOutcome::Done;
        }

        let backend = self.backend.current().await;
        match backend.get_history(prompt_id).await {
            Ok(response) => match history_entry(&response, prompt_id) {
                Some(entry) => {
                    tracing::info!(prompt_id, "History check found result");
                    self.complete(prompt_id, Some(entry.clone())).await;
                    PollOutcome::Done
                }
                None => PollOutcome::Pending,
            },
            Err(e) => {
                tracing::warn!(prompt_id, error = %e, "History poll failed");
                PollOutcome::Pending
            }
        }
    }

    /// Watchdog expiry from the poller.
    pub(crate) async fn expire(&self, token: u64, limit: Duration) {
        let message = format!("Generation timed out after {}s", limit.as_secs());
        let (expired, prompt_id) = {
            let mut state = self.state.lock().await;
            let prompt_id = state.active_prompt_id().map(str::to_string);
            (state.timed_out(token, message.clone()), prompt_id)
        };
        if !expired {
            return;
        }

        self.stop_poller().await;
        tracing::warn!(prompt_id = ?prompt_id, timeout_secs = limit.as_secs(), "Generation timed out");
        self.publish(SessionEvent::StatusChanged {
            status: GenerationStatus::Error,
            prompt_id: prompt_id.clone(),
        });
        self.publish(SessionEvent::Failed { prompt_id, message });
    }

    // ---- private helpers ----

    async fn upload_and_submit(
        &self,
        params: &GenerationParameters,
    ) -> Result<(String, Vec<String>), StudioError> {
        let template = self.templates.get(params.mode);
        preflight(template, params)?;

        let backend = self.backend.current().await;
        let mut filenames = Vec::with_capacity(params.input_images.len());
        for image in &params.input_images {
            let name = match image {
                ImageRef::Server(name) => name.clone(),
                ImageRef::Local(path) => {
                    let (bytes, file_name) = read_local_image(path).await?;
                    let name = backend.upload_image(bytes, &file_name, true).await?;
                    tracing::info!(local = %path.display(), uploaded = %name, "Input image uploaded");
                    name
                }
            };
            filenames.push(name);
        }

        let graph = build_job_graph(template, params, &filenames)?;
        let response = backend
            .submit_workflow(&graph.to_value(), &self.client_id)
            .await?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            nodes = graph.len(),
            "Workflow submitted",
        );
        Ok((response.prompt_id, filenames))
    }

    async fn locate_artifact(
        &self,
        session: &GenerationSession,
        prompt_id: &str,
        entry: Option<serde_json::Value>,
    ) -> Result<ArtifactRef, StudioError> {
        let entry = match entry {
            Some(entry) => entry,
            None => self.fetch_history_entry(prompt_id).await?,
        };
        resolve_artifact(&entry, session.mode, session.extend)
    }

    async fn fetch_history_entry(&self, prompt_id: &str) -> Result<serde_json::Value, StudioError> {
        let backend = self.backend.current().await;
        for attempt in 1..=HISTORY_FETCH_ATTEMPTS {
            let response = backend.get_history(prompt_id).await?;
            if let Some(entry) = history_entry(&response, prompt_id) {
                return Ok(entry.clone());
            }
            if attempt < HISTORY_FETCH_ATTEMPTS {
                tracing::debug!(prompt_id, attempt, "History entry not written yet");
                tokio::time::sleep(HISTORY_FETCH_DELAY).await;
            }
        }
        Err(StudioError::NotFound(format!(
            "history has no entry for prompt {prompt_id}"
        )))
    }

    async fn fail(&self, token: u64, error: &StudioError) {
        let (failed, prompt_id) = {
            let mut state = self.state.lock().await;
            (state.fail(token, error), state.active_prompt_id().map(str::to_string))
        };
        if !failed {
            return;
        }
        self.stop_poller().await;
        tracing::warn!(error = %error, "Generation failed");
        self.publish(SessionEvent::StatusChanged {
            status: GenerationStatus::Error,
            prompt_id: prompt_id.clone(),
        });
        self.publish(SessionEvent::Failed {
            prompt_id,
            message: error.user_message(),
        });
    }

    async fn start_poller(self: &Arc<Self>, token: u64, prompt_id: &str) {
        let handle = poller::spawn(
            Arc::clone(self),
            token,
            prompt_id.to_string(),
            self.poll_interval,
            self.execution_timeout,
        );
        if let Some(previous) = self.poller.lock().await.replace(handle) {
            tracing::debug!(prompt_id = %previous.prompt_id(), "Replacing previous poller");
            previous.stop();
        }
    }

    async fn stop_poller(&self) {
        if let Some(handle) = self.poller.lock().await.take() {
            handle.stop();
        }
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn read_local_image(path: &Path) -> Result<(Vec<u8>, String), StudioError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            StudioError::Validation(format!("{} is not a file path", path.display()))
        })?;
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        StudioError::Validation(format!("Cannot read {}: {e}", path.display()))
    })?;
    Ok((bytes, file_name))
}
