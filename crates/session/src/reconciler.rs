//! The generation-session state machine.
//!
//! [`CompletionReconciler`] owns the one active [`GenerationSession`]
//! and merges the three completion producers (push channel, history
//! poller, post-submit check) into a single decision. It performs no
//! I/O: the controller feeds it inputs and acts on what it returns.
//!
//! ```text
//! Idle/Finished/Error --begin--> Uploading --mark_queued--> Queued
//! Queued --execution_start / progress / executing--> Executing
//! Queued/Executing --claim--> Finished
//! any active --execution_error / fail / timeout--> Error
//! any --interrupt--> Idle
//! ```

use std::collections::VecDeque;

use serde::Serialize;
use studio_comfyui::messages::ComfyUIMessage;
use studio_core::history::HistoryRecord;
use studio_core::params::GenerationMode;
use studio_core::templates::{phase_for_node, Phase};
use studio_core::types::EpochMillis;
use studio_core::StudioError;

use crate::events::SessionEvent;

/// How many `execution_success` prompt IDs to remember for the
/// success-before-submit-returns race.
pub const PENDING_SUCCESS_CAPACITY: usize = 64;

/// Progress shown once the save node starts.
pub const SAVING_PERCENT: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GenerationStatus {
    Idle,
    Uploading,
    Queued,
    Executing,
    Finished,
    Error,
}

impl GenerationStatus {
    /// A new submission may not start while this is true.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Uploading | Self::Queued | Self::Executing)
    }

    /// Whether the history poller should be running.
    pub fn is_polling(&self) -> bool {
        matches!(self, Self::Queued | Self::Executing)
    }
}

/// The active submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSession {
    /// Distinguishes this session from earlier ones so late async work
    /// cannot touch it.
    pub token: u64,
    /// Set once the backend accepted the graph.
    pub prompt_id: Option<String>,
    pub mode: GenerationMode,
    pub extend: bool,
    pub prompt: String,
    pub seed: u64,
    pub input_filename: Option<String>,
    pub submitted_at: EpochMillis,
}

/// What the caller supplies to start a session.
#[derive(Debug, Clone)]
pub struct SessionStart {
    pub mode: GenerationMode,
    pub extend: bool,
    pub prompt: String,
    pub seed: u64,
    pub submitted_at: EpochMillis,
}

/// Read-only view for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSnapshot {
    pub status: GenerationStatus,
    pub progress: u8,
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub prompt_id: Option<String>,
    pub result: Option<HistoryRecord>,
}

/// Result of [`CompletionReconciler::mark_queued`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Waiting for the backend; start the poller and run the immediate check.
    Queued,
    /// Success for this prompt was already seen; complete right away.
    AlreadyFinished,
    /// The session was interrupted or replaced while uploading.
    Superseded,
}

/// Result of feeding one push message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Cross-talk, informational, or no session to update.
    Ignored,
    /// State changed; publish these events.
    Updated(Vec<SessionEvent>),
    /// A completion signal for the active prompt; call `complete`.
    Complete(String),
    /// The session moved to Error with this message.
    Failed(String),
}

#[derive(Debug)]
pub struct CompletionReconciler {
    status: GenerationStatus,
    progress: u8,
    phase: Option<Phase>,
    message: Option<String>,
    session: Option<GenerationSession>,
    result: Option<HistoryRecord>,
    /// Prompt ID whose completion has been claimed.
    claimed: Option<String>,
    /// Claimed but neither recorded nor failed yet; the artifact is
    /// still being fetched.
    completing: bool,
    pending_success: VecDeque<String>,
    next_token: u64,
}

impl Default for CompletionReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionReconciler {
    pub fn new() -> Self {
        Self {
            status: GenerationStatus::Idle,
            progress: 0,
            phase: None,
            message: None,
            session: None,
            result: None,
            claimed: None,
            completing: false,
            pending_success: VecDeque::with_capacity(PENDING_SUCCESS_CAPACITY),
            next_token: 1,
        }
    }

    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    pub fn session(&self) -> Option<&GenerationSession> {
        self.session.as_ref()
    }

    pub fn active_prompt_id(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.prompt_id.as_deref())
    }

    pub fn snapshot(&self) -> GenerationSnapshot {
        GenerationSnapshot {
            status: self.status,
            progress: self.progress,
            phase: self.phase,
            message: self.message.clone(),
            prompt_id: self.active_prompt_id().map(str::to_string),
            result: self.result.clone(),
        }
    }

    // ---- lifecycle ----

    /// Start a new session in Uploading. Any finished or failed session
    /// is discarded; a live one is not.
    pub fn begin(&mut self, start: SessionStart) -> Result<u64, StudioError> {
        if self.status.is_busy() {
            return Err(StudioError::Validation(
                "A generation is already in progress".to_string(),
            ));
        }
        if self.completing {
            return Err(StudioError::Validation(
                "The previous generation is still being saved".to_string(),
            ));
        }

        let token = self.next_token;
        self.next_token += 1;
        self.session = Some(GenerationSession {
            token,
            prompt_id: None,
            mode: start.mode,
            extend: start.extend,
            prompt: start.prompt,
            seed: start.seed,
            input_filename: None,
            submitted_at: start.submitted_at,
        });
        self.status = GenerationStatus::Uploading;
        self.progress = 0;
        self.phase = None;
        self.message = None;
        self.result = None;
        self.claimed = None;
        Ok(token)
    }

    /// The backend accepted the graph under `prompt_id`.
    pub fn mark_queued(
        &mut self,
        token: u64,
        prompt_id: &str,
        input_filename: Option<String>,
    ) -> QueueOutcome {
        if self.status != GenerationStatus::Uploading {
            return QueueOutcome::Superseded;
        }
        let Some(session) = self.session.as_mut().filter(|s| s.token == token) else {
            return QueueOutcome::Superseded;
        };

        session.prompt_id = Some(prompt_id.to_string());
        session.input_filename = input_filename;
        self.status = GenerationStatus::Queued;

        if self.pending_success.iter().any(|id| id == prompt_id) {
            QueueOutcome::AlreadyFinished
        } else {
            QueueOutcome::Queued
        }
    }

    /// Submission or upload failed. Returns `false` if `token` is stale.
    pub fn fail(&mut self, token: u64, error: &StudioError) -> bool {
        if !self.is_current(token) || !self.status.is_busy() {
            return false;
        }
        self.status = GenerationStatus::Error;
        self.phase = None;
        self.message = Some(error.user_message());
        true
    }

    /// User interrupt: back to Idle whatever the backend says next.
    /// Returns the prompt ID that was active, if any.
    pub fn interrupt(&mut self) -> Option<String> {
        let prompt_id = self.session.take().and_then(|s| s.prompt_id);
        let was_busy = self.status.is_busy();
        self.status = GenerationStatus::Idle;
        self.completing = false;
        self.progress = 0;
        self.phase = None;
        if was_busy {
            self.message = Some("Generation interrupted".to_string());
        }
        prompt_id
    }

    /// Watchdog expiry. Returns `false` if nothing was waiting.
    pub fn timed_out(&mut self, token: u64, message: String) -> bool {
        if !self.is_current(token) || !self.status.is_polling() {
            return false;
        }
        self.status = GenerationStatus::Error;
        self.phase = None;
        self.message = Some(message);
        true
    }

    /// Whether a poller for (`token`, `prompt_id`) should keep going.
    pub fn is_polling(&self, token: u64, prompt_id: &str) -> bool {
        self.status.is_polling()
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.token == token && s.prompt_id.as_deref() == Some(prompt_id))
    }

    // ---- completion ----

    /// The single gate every completion producer passes through.
    ///
    /// Returns the session to resolve the first time it is called for
    /// the active prompt, and `None` for every repeat, stale or foreign
    /// prompt ID.
    pub fn claim(&mut self, prompt_id: &str) -> Option<GenerationSession> {
        if !self.status.is_polling() {
            return None;
        }
        if self.active_prompt_id() != Some(prompt_id) {
            return None;
        }
        if self.claimed.as_deref() == Some(prompt_id) || self.result.is_some() {
            return None;
        }

        self.claimed = Some(prompt_id.to_string());
        self.completing = true;
        self.status = GenerationStatus::Finished;
        self.progress = 100;
        self.phase = None;
        self.session.clone()
    }

    /// Store the record for a claimed session. Returns `false` when a
    /// result is already attached or the session was replaced; the
    /// caller must then skip the history append.
    pub fn attach_result(&mut self, token: u64, record: HistoryRecord) -> bool {
        if !self.is_current(token) || self.result.is_some() {
            return false;
        }
        self.result = Some(record);
        self.completing = false;
        true
    }

    /// Finished on the backend but the artifact could not be found or
    /// fetched. Status stays Finished.
    pub fn retrieval_failed(&mut self, token: u64, error: &StudioError) -> bool {
        if !self.is_current(token) {
            return false;
        }
        self.completing = false;
        self.message = Some(match error {
            StudioError::NotFound(_) => error.user_message(),
            other => StudioError::NotFound(other.user_message()).user_message(),
        });
        true
    }

    /// Attach an informational message without changing status.
    pub fn note(&mut self, token: u64, message: String) {
        if self.is_current(token) {
            self.message = Some(message);
        }
    }

    // ---- push messages ----

    /// Feed one push message.
    pub fn apply(&mut self, msg: &ComfyUIMessage) -> Reaction {
        if let ComfyUIMessage::ExecutionSuccess(data) = msg {
            self.remember_success(&data.prompt_id);
            return self.completion_signal(&data.prompt_id);
        }

        if !self.status.is_polling() {
            return Reaction::Ignored;
        }
        let Some(active) = self.active_prompt_id().map(str::to_string) else {
            return Reaction::Ignored;
        };
        if let Some(id) = msg.prompt_id() {
            if id != active {
                tracing::debug!(
                    kind = msg.kind(),
                    prompt_id = %id,
                    active = %active,
                    "Ignoring message for another prompt",
                );
                return Reaction::Ignored;
            }
        }
        let prompt_id = Some(active.clone());

        match msg {
            ComfyUIMessage::ExecutionStart(_) => {
                let mut events = Vec::new();
                self.enter_executing(&mut events);
                Reaction::Updated(events)
            }
            ComfyUIMessage::Executing(data) => match data.node.as_deref() {
                // Older servers signal completion this way.
                None if data.prompt_id.as_deref() == Some(active.as_str()) => {
                    Reaction::Complete(active)
                }
                None => Reaction::Ignored,
                Some(node) => {
                    let mut events = Vec::new();
                    self.enter_executing(&mut events);
                    let Some(mode) = self.session.as_ref().map(|s| s.mode) else {
                        return Reaction::Updated(events);
                    };
                    if let Some(phase) = phase_for_node(mode, node) {
                        if self.phase != Some(phase) {
                            self.phase = Some(phase);
                            events.push(SessionEvent::PhaseChanged {
                                prompt_id: prompt_id.clone(),
                                phase,
                            });
                        }
                        if phase == Phase::Saving && self.progress != SAVING_PERCENT {
                            self.progress = SAVING_PERCENT;
                            events.push(SessionEvent::Progress {
                                prompt_id,
                                percent: SAVING_PERCENT,
                            });
                        }
                    }
                    Reaction::Updated(events)
                }
            },
            ComfyUIMessage::Progress(data) => {
                let mut events = Vec::new();
                self.enter_executing(&mut events);
                let percent = data.percent();
                if self.phase != Some(Phase::Saving) && percent != self.progress {
                    self.progress = percent;
                    events.push(SessionEvent::Progress { prompt_id, percent });
                }
                Reaction::Updated(events)
            }
            ComfyUIMessage::ExecutionError(data) => {
                let message = StudioError::Execution(data.message()).user_message();
                self.status = GenerationStatus::Error;
                self.phase = None;
                self.message = Some(message.clone());
                Reaction::Failed(message)
            }
            ComfyUIMessage::ExecutionInterrupted(_) => {
                let message = "Generation was interrupted on the server".to_string();
                self.status = GenerationStatus::Error;
                self.phase = None;
                self.message = Some(message.clone());
                Reaction::Failed(message)
            }
            ComfyUIMessage::Status(_)
            | ComfyUIMessage::ExecutionCached(_)
            | ComfyUIMessage::Executed(_)
            | ComfyUIMessage::ExecutionSuccess(_) => Reaction::Ignored,
        }
    }

    // ---- private helpers ----

    fn is_current(&self, token: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.token == token)
    }

    fn enter_executing(&mut self, events: &mut Vec<SessionEvent>) {
        if self.status == GenerationStatus::Queued {
            self.status = GenerationStatus::Executing;
            events.push(SessionEvent::StatusChanged {
                status: GenerationStatus::Executing,
                prompt_id: self.active_prompt_id().map(str::to_string),
            });
        }
    }

    fn remember_success(&mut self, prompt_id: &str) {
        if self.pending_success.iter().any(|id| id == prompt_id) {
            return;
        }
        if self.pending_success.len() == PENDING_SUCCESS_CAPACITY {
            self.pending_success.pop_front();
        }
        self.pending_success.push_back(prompt_id.to_string());
    }

    fn completion_signal(&self, prompt_id: &str) -> Reaction {
        if self.status.is_polling() && self.active_prompt_id() == Some(prompt_id) {
            Reaction::Complete(prompt_id.to_string())
        } else {
            Reaction::Ignored
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use studio_comfyui::messages::parse_message;
    use studio_core::resolver::MediaKind;

    use super::*;

    fn start(mode: GenerationMode) -> SessionStart {
        SessionStart {
            mode,
            extend: false,
            prompt: "a red fox".to_string(),
            seed: 7,
            submitted_at: 1_000,
        }
    }

    fn msg(json: &str) -> ComfyUIMessage {
        parse_message(json).unwrap()
    }

    fn success(prompt_id: &str) -> ComfyUIMessage {
        msg(&format!(
            r#"{{"type":"execution_success","data":{{"prompt_id":"{prompt_id}"}}}}"#
        ))
    }

    fn record(prompt_id: &str) -> HistoryRecord {
        HistoryRecord {
            id: prompt_id.to_string(),
            filename: "out.png".to_string(),
            subfolder: String::new(),
            folder_type: "output".to_string(),
            media_type: MediaKind::Image,
            mode: Some(GenerationMode::Edit),
            input_filename: None,
            prompt: "a red fox".to_string(),
            seed: 7,
            timestamp: 2_000,
            duration_ms: 1_000,
        }
    }

    fn queued(prompt_id: &str) -> (CompletionReconciler, u64) {
        let mut r = CompletionReconciler::new();
        let token = r.begin(start(GenerationMode::Edit)).unwrap();
        assert_eq!(r.mark_queued(token, prompt_id, None), QueueOutcome::Queued);
        (r, token)
    }

    // -- lifecycle --

    #[test]
    fn begin_moves_to_uploading_and_resets() {
        let mut r = CompletionReconciler::new();
        let token = r.begin(start(GenerationMode::Generate)).unwrap();
        let snap = r.snapshot();
        assert_eq!(snap.status, GenerationStatus::Uploading);
        assert_eq!(snap.progress, 0);
        assert!(snap.result.is_none());
        assert_eq!(r.session().map(|s| s.token), Some(token));
    }

    #[test]
    fn begin_rejected_while_busy() {
        let (mut r, _) = queued("abc");
        assert_matches!(
            r.begin(start(GenerationMode::Edit)),
            Err(StudioError::Validation(_))
        );
    }

    #[test]
    fn begin_allowed_after_error() {
        let mut r = CompletionReconciler::new();
        let token = r.begin(start(GenerationMode::Edit)).unwrap();
        assert!(r.fail(token, &StudioError::Transport("refused".into())));
        assert_eq!(r.status(), GenerationStatus::Error);
        assert_eq!(r.snapshot().message.as_deref(), Some("refused"));
        assert!(r.begin(start(GenerationMode::Edit)).is_ok());
    }

    #[test]
    fn stale_token_cannot_queue_or_fail() {
        let mut r = CompletionReconciler::new();
        let old = r.begin(start(GenerationMode::Edit)).unwrap();
        r.interrupt();
        let new = r.begin(start(GenerationMode::Edit)).unwrap();
        assert_ne!(old, new);
        assert_eq!(r.mark_queued(old, "late", None), QueueOutcome::Superseded);
        assert!(!r.fail(old, &StudioError::Transport("x".into())));
        assert_eq!(r.status(), GenerationStatus::Uploading);
    }

    // -- completion --

    #[test]
    fn duplicate_success_claims_once() {
        let (mut r, token) = queued("abc123");
        assert_eq!(r.apply(&success("abc123")), Reaction::Complete("abc123".into()));

        let session = r.claim("abc123").unwrap();
        assert_eq!(session.token, token);
        assert_eq!(r.status(), GenerationStatus::Finished);

        assert_eq!(r.apply(&success("abc123")), Reaction::Ignored);
        assert!(r.claim("abc123").is_none());

        assert!(r.attach_result(token, record("abc123")));
        assert!(!r.attach_result(token, record("abc123")));
    }

    #[test]
    fn claim_rejects_foreign_prompt() {
        let (mut r, _) = queued("abc123");
        assert!(r.claim("other").is_none());
        assert_eq!(r.status(), GenerationStatus::Queued);
    }

    #[test]
    fn success_before_queue_is_buffered() {
        let mut r = CompletionReconciler::new();
        let token = r.begin(start(GenerationMode::Edit)).unwrap();
        assert_eq!(r.apply(&success("fast")), Reaction::Ignored);
        assert_eq!(r.mark_queued(token, "fast", None), QueueOutcome::AlreadyFinished);
        assert!(r.claim("fast").is_some());
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let mut r = CompletionReconciler::new();
        for i in 0..(PENDING_SUCCESS_CAPACITY + 5) {
            r.apply(&success(&format!("p{i}")));
        }
        assert_eq!(r.pending_success.len(), PENDING_SUCCESS_CAPACITY);
        assert!(!r.pending_success.iter().any(|id| id == "p0"));
    }

    #[test]
    fn executing_null_node_completes_active_prompt() {
        let (mut r, _) = queued("abc");
        let reaction = r.apply(&msg(r#"{"type":"executing","data":{"node":null,"prompt_id":"abc"}}"#));
        assert_eq!(reaction, Reaction::Complete("abc".into()));
    }

    #[test]
    fn retrieval_failure_keeps_finished() {
        let (mut r, token) = queued("abc");
        r.claim("abc").unwrap();
        assert!(r.retrieval_failed(token, &StudioError::NotFound("nothing".into())));
        let snap = r.snapshot();
        assert_eq!(snap.status, GenerationStatus::Finished);
        assert_eq!(
            snap.message.as_deref(),
            Some("Generated but retrieval failed: nothing")
        );
        assert!(snap.result.is_none());
    }

    #[test]
    fn new_session_waits_for_claimed_completion() {
        let (mut r, token) = queued("abc");
        r.claim("abc").unwrap();
        assert_matches!(
            r.begin(start(GenerationMode::Edit)),
            Err(StudioError::Validation(msg)) if msg.contains("still being saved")
        );

        assert!(r.attach_result(token, record("abc")));
        assert!(r.begin(start(GenerationMode::Edit)).is_ok());
    }

    #[test]
    fn failed_retrieval_releases_next_session() {
        let (mut r, token) = queued("abc");
        r.claim("abc").unwrap();
        r.retrieval_failed(token, &StudioError::NotFound("nothing".into()));
        assert!(r.begin(start(GenerationMode::Edit)).is_ok());
    }

    // -- ordering --

    #[test]
    fn cross_talk_does_not_change_state() {
        let (mut r, _) = queued("mine");
        let before = r.snapshot();
        assert_eq!(
            r.apply(&msg(r#"{"type":"progress","data":{"value":5,"max":10,"prompt_id":"theirs"}}"#)),
            Reaction::Ignored
        );
        assert_eq!(
            r.apply(&msg(r#"{"type":"executing","data":{"node":"3","prompt_id":"theirs"}}"#)),
            Reaction::Ignored
        );
        assert_eq!(
            r.apply(&msg(r#"{"type":"execution_error","data":{"prompt_id":"theirs","exception_message":"boom"}}"#)),
            Reaction::Ignored
        );
        assert_eq!(r.snapshot(), before);
    }

    #[test]
    fn progress_moves_to_executing_and_floors() {
        let (mut r, _) = queued("abc");
        let reaction = r.apply(&msg(r#"{"type":"progress","data":{"value":2,"max":3,"prompt_id":"abc"}}"#));
        assert_matches!(reaction, Reaction::Updated(events) if events.len() == 2);
        assert_eq!(r.status(), GenerationStatus::Executing);
        assert_eq!(r.snapshot().progress, 66);
    }

    #[test]
    fn progress_without_prompt_id_is_accepted() {
        let (mut r, _) = queued("abc");
        r.apply(&msg(r#"{"type":"progress","data":{"value":1,"max":4}}"#));
        assert_eq!(r.snapshot().progress, 25);
    }

    #[test]
    fn save_node_forces_ninety_nine() {
        let (mut r, _) = queued("abc");
        r.apply(&msg(r#"{"type":"executing","data":{"node":"3","prompt_id":"abc"}}"#));
        assert_eq!(r.snapshot().phase, Some(Phase::Generating));
        r.apply(&msg(r#"{"type":"executing","data":{"node":"79","prompt_id":"abc"}}"#));
        let snap = r.snapshot();
        assert_eq!(snap.phase, Some(Phase::Saving));
        assert_eq!(snap.progress, SAVING_PERCENT);

        r.apply(&msg(r#"{"type":"progress","data":{"value":1,"max":10,"prompt_id":"abc"}}"#));
        assert_eq!(r.snapshot().progress, SAVING_PERCENT);
    }

    #[test]
    fn messages_before_queue_are_ignored() {
        let mut r = CompletionReconciler::new();
        r.begin(start(GenerationMode::Edit)).unwrap();
        assert_eq!(
            r.apply(&msg(r#"{"type":"progress","data":{"value":1,"max":2}}"#)),
            Reaction::Ignored
        );
        assert_eq!(r.status(), GenerationStatus::Uploading);
    }

    // -- errors and interrupt --

    #[test]
    fn execution_error_is_terminal() {
        let (mut r, _) = queued("abc");
        let reaction = r.apply(&msg(
            r#"{"type":"execution_error","data":{"prompt_id":"abc","exception_message":"CUDA out of memory"}}"#,
        ));
        assert_eq!(
            reaction,
            Reaction::Failed("Generation failed: CUDA out of memory".into())
        );
        assert_eq!(r.status(), GenerationStatus::Error);
        assert!(r.claim("abc").is_none());
        assert_eq!(r.apply(&success("abc")), Reaction::Ignored);
    }

    #[test]
    fn interrupt_resets_to_idle_without_result() {
        let (mut r, token) = queued("abc");
        assert_eq!(r.interrupt().as_deref(), Some("abc"));
        let snap = r.snapshot();
        assert_eq!(snap.status, GenerationStatus::Idle);
        assert_eq!(snap.message.as_deref(), Some("Generation interrupted"));
        assert!(r.claim("abc").is_none());
        assert!(!r.attach_result(token, record("abc")));
        assert!(!r.is_polling(token, "abc"));
    }

    #[test]
    fn timeout_only_applies_while_waiting() {
        let (mut r, token) = queued("abc");
        assert!(r.is_polling(token, "abc"));
        assert!(r.timed_out(token, "Generation timed out".into()));
        assert_eq!(r.status(), GenerationStatus::Error);
        assert!(!r.timed_out(token, "again".into()));
    }
}
