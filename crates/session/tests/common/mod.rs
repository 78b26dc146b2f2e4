//! In-memory backend for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use studio_comfyui::messages::{parse_message, ComfyUIMessage};
use studio_comfyui::{Backend, ComfyUIApiError, SubmitResponse};
use studio_core::templates::WorkflowTemplateStore;
use studio_session::handle::BackendHandle;
use studio_session::history::SessionHistoryStore;
use studio_session::{GenerationController, SessionEvent};
use tokio::sync::broadcast;

pub const BASE_URL: &str = "http://fake:8188";
pub const HISTORY_FILE: &str = "mobile_history";

#[derive(Default)]
pub struct FakeState {
    /// `(filename, byte count, overwrite)` per upload, in call order.
    pub uploads: Vec<(String, usize, bool)>,
    /// Makes every upload take this long.
    pub upload_delay: Option<Duration>,
    pub submitted: Vec<Value>,
    pub client_ids: Vec<String>,
    pub prompt_id: String,
    pub submit_error: Option<(u16, String)>,
    /// History entries by prompt ID; absent means "not finished".
    pub history: HashMap<String, Value>,
    pub history_calls: usize,
    pub interrupts: usize,
    /// Prompt IDs passed to `cancel_prompt`.
    pub cancelled: Vec<String>,
    pub frees: usize,
    pub free_fails: bool,
    pub userdata: HashMap<String, Value>,
    pub deleted: Vec<String>,
    /// Filenames the delete endpoint answers 404 for.
    pub missing_files: Vec<String>,
    pub delete_fails: bool,
    pub object_info: Value,
    pub offline: bool,
}

pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                prompt_id: "abc123".to_string(),
                ..Default::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_history(&self, prompt_id: &str, entry: Value) {
        self.with(|s| s.history.insert(prompt_id.to_string(), entry));
    }

    pub fn userdata(&self, file: &str) -> Option<Value> {
        self.with(|s| s.userdata.get(file).cloned())
    }

    fn offline_error(&self) -> Result<(), ComfyUIApiError> {
        if self.with(|s| s.offline) {
            return Err(ComfyUIApiError::ApiError {
                status: 503,
                body: "offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn base_url(&self) -> &str {
        BASE_URL
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        overwrite: bool,
    ) -> Result<String, ComfyUIApiError> {
        self.offline_error()?;
        if let Some(delay) = self.with(|s| s.upload_delay) {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| s.uploads.push((filename.to_string(), bytes.len(), overwrite)));
        Ok(filename.to_string())
    }

    async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.offline_error()?;
        self.with(|s| {
            if let Some((status, body)) = s.submit_error.clone() {
                return Err(ComfyUIApiError::ApiError { status, body });
            }
            s.submitted.push(workflow.clone());
            s.client_ids.push(client_id.to_string());
            Ok(SubmitResponse {
                prompt_id: s.prompt_id.clone(),
                number: s.submitted.len() as i64,
            })
        })
    }

    async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        self.offline_error()?;
        self.with(|s| {
            s.history_calls += 1;
            Ok(match s.history.get(prompt_id) {
                Some(entry) => json!({ prompt_id: entry }),
                None => json!({}),
            })
        })
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        self.with(|s| s.interrupts += 1);
        self.offline_error()
    }

    async fn cancel_prompt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.offline_error()?;
        self.with(|s| s.cancelled.push(prompt_id.to_string()));
        Ok(())
    }

    async fn free_memory(
        &self,
        _unload_models: bool,
        _free_memory: bool,
    ) -> Result<(), ComfyUIApiError> {
        self.with(|s| {
            s.frees += 1;
            if s.free_fails {
                Err(ComfyUIApiError::ApiError {
                    status: 500,
                    body: "cannot free".to_string(),
                })
            } else {
                Ok(())
            }
        })
    }

    async fn object_info_options(
        &self,
        node_type: &str,
        input: &str,
    ) -> Result<Vec<String>, ComfyUIApiError> {
        self.offline_error()?;
        let info = self.with(|s| s.object_info.clone());
        Ok(studio_comfyui::api::combo_options(&info, node_type, input))
    }

    async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        self.offline_error()?;
        Ok(json!({"system": {"os": "posix"}}))
    }

    async fn read_userdata(&self, file: &str) -> Result<Option<Value>, ComfyUIApiError> {
        self.offline_error()?;
        Ok(self.userdata(file))
    }

    async fn write_userdata(&self, file: &str, data: &Value) -> Result<(), ComfyUIApiError> {
        self.offline_error()?;
        self.with(|s| s.userdata.insert(file.to_string(), data.clone()));
        Ok(())
    }

    async fn delete_output(
        &self,
        filename: &str,
        _subfolder: &str,
        _folder_type: &str,
    ) -> Result<(), ComfyUIApiError> {
        self.with(|s| {
            if s.delete_fails {
                return Err(ComfyUIApiError::ApiError {
                    status: 500,
                    body: "disk error".to_string(),
                });
            }
            if s.missing_files.iter().any(|f| f == filename) {
                return Err(ComfyUIApiError::ApiError {
                    status: 404,
                    body: "not found".to_string(),
                });
            }
            s.deleted.push(filename.to_string());
            Ok(())
        })
    }
}

/* --------------------------------------------------------------------------
Builders
-------------------------------------------------------------------------- */

pub fn handle(fake: &Arc<FakeBackend>) -> BackendHandle {
    BackendHandle::new(Arc::clone(fake) as Arc<dyn Backend>)
}

pub fn history_store(fake: &Arc<FakeBackend>) -> SessionHistoryStore {
    SessionHistoryStore::new(handle(fake), HISTORY_FILE)
}

/// Controller whose poller effectively never fires.
pub fn controller(fake: &Arc<FakeBackend>) -> Arc<GenerationController> {
    controller_with(fake, builtin_templates(), Duration::from_secs(3600), None)
}

pub fn controller_with(
    fake: &Arc<FakeBackend>,
    templates: WorkflowTemplateStore,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Arc<GenerationController> {
    let backend = handle(fake);
    let history = SessionHistoryStore::new(backend.clone(), HISTORY_FILE);
    let (tx, _) = broadcast::channel(64);
    Arc::new(
        GenerationController::new(backend, templates, history, "test-client", tx)
            .with_poll_interval(poll_interval)
            .with_execution_timeout(timeout),
    )
}

pub fn builtin_templates() -> WorkflowTemplateStore {
    WorkflowTemplateStore::builtin().unwrap()
}

/* --------------------------------------------------------------------------
Messages and payloads
-------------------------------------------------------------------------- */

pub fn message(json: &str) -> ComfyUIMessage {
    parse_message(json).unwrap()
}

pub fn success(prompt_id: &str) -> ComfyUIMessage {
    message(&format!(
        r#"{{"type":"execution_success","data":{{"prompt_id":"{prompt_id}"}}}}"#
    ))
}

pub fn image_output(node: &str, filename: &str) -> Value {
    json!({
        "outputs": {
            node: {"images": [{"filename": filename, "subfolder": "mobile", "type": "output"}]}
        },
        "status": {"status_str": "success", "completed": true}
    })
}

/// Drain everything currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait up to `limit` for an event matching `pred`.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    limit: Duration,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    tokio::time::timeout(limit, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

pub fn history_items(fake: &FakeBackend) -> Vec<Value> {
    fake.userdata(HISTORY_FILE)
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
}
