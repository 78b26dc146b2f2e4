//! Top-level handle for a studio session.
//!
//! [`StudioManager`] wires the gateway, controller, push channel and
//! user-data stores together, and owns the runtime backend address.
//! Call [`StudioManager::start`] once at startup.

use std::str::FromStr;
use std::sync::Arc;

use studio_comfyui::{Backend, ComfyUIApi};
use studio_core::history::HistoryRecord;
use studio_core::params::GenerationParameters;
use studio_core::templates::WorkflowTemplateStore;
use studio_core::StudioError;
use tokio::sync::{broadcast, Mutex};

use crate::config::StudioConfig;
use crate::controller::GenerationController;
use crate::events::SessionEvent;
use crate::handle::BackendHandle;
use crate::history::{DeleteOutcome, HistoryPage, SessionHistoryStore};
use crate::push::PushChannel;
use crate::reconciler::GenerationSnapshot;
use crate::userdata::{Favourites, PromptLibrary, UserDataFile};

/// Broadcast channel capacity for session events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Server-side choice lists the UI offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Loras,
    Models,
    InputImages,
    Samplers,
    Schedulers,
}

impl OptionKind {
    /// `(node type, input field)` whose combo values hold the list.
    pub fn source(&self) -> (&'static str, &'static str) {
        match self {
            Self::Loras => ("LoraLoader", "lora_name"),
            Self::Models => ("UNETLoader", "unet_name"),
            Self::InputImages => ("LoadImage", "image"),
            Self::Samplers => ("KSampler", "sampler_name"),
            Self::Schedulers => ("KSampler", "scheduler"),
        }
    }
}

impl FromStr for OptionKind {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loras" => Ok(Self::Loras),
            "models" => Ok(Self::Models),
            "images" | "input-images" => Ok(Self::InputImages),
            "samplers" => Ok(Self::Samplers),
            "schedulers" => Ok(Self::Schedulers),
            other => Err(StudioError::Validation(format!(
                "Unknown list {other:?} (expected loras, models, images, samplers or schedulers)"
            ))),
        }
    }
}

pub struct StudioManager {
    backend: BackendHandle,
    controller: Arc<GenerationController>,
    prompts: PromptLibrary,
    favourites: Favourites,
    push: Mutex<Option<PushChannel>>,
}

impl StudioManager {
    /// Connect to the configured backend over HTTP and open the push
    /// channel.
    pub async fn start(config: StudioConfig) -> Result<Arc<Self>, StudioError> {
        let api: Arc<dyn Backend> = Arc::new(ComfyUIApi::new(config.server_url.clone()));
        let manager = Arc::new(Self::new(&config, api)?);
        manager.open_push(&config.server_url).await;
        Ok(manager)
    }

    /// Build without a push channel, on an arbitrary gateway.
    pub fn new(config: &StudioConfig, backend: Arc<dyn Backend>) -> Result<Self, StudioError> {
        let templates = match &config.template_dir {
            Some(dir) => WorkflowTemplateStore::with_overrides(dir)?,
            None => WorkflowTemplateStore::builtin()?,
        };

        let backend = BackendHandle::new(backend);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let client_id = uuid::Uuid::new_v4().to_string();
        let history = SessionHistoryStore::new(backend.clone(), config.history_file.clone());

        let controller = GenerationController::new(
            backend.clone(),
            templates,
            history,
            client_id,
            event_tx,
        )
        .with_poll_interval(config.poll_interval)
        .with_execution_timeout(config.execution_timeout);

        Ok(Self {
            prompts: PromptLibrary::new(UserDataFile::new(backend.clone(), config.prompts_file.clone())),
            favourites: Favourites::new(UserDataFile::new(backend.clone(), config.favourites_file.clone())),
            backend,
            controller: Arc::new(controller),
            push: Mutex::new(None),
        })
    }

    pub fn controller(&self) -> &Arc<GenerationController> {
        &self.controller
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.controller.subscribe()
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.prompts
    }

    pub fn favourites(&self) -> &Favourites {
        &self.favourites
    }

    pub fn history(&self) -> &SessionHistoryStore {
        self.controller.history()
    }

    pub async fn server_url(&self) -> String {
        self.backend.base_url().await
    }

    pub async fn snapshot(&self) -> GenerationSnapshot {
        self.controller.snapshot().await
    }

    // ---- generation ----

    pub async fn generate(&self, params: GenerationParameters) -> Result<String, StudioError> {
        self.controller.submit(params).await
    }

    pub async fn interrupt(&self) {
        self.controller.interrupt().await;
    }

    pub async fn free_memory(&self) {
        self.controller.free_memory().await;
    }

    // ---- history ----

    pub async fn load_history(&self) -> Result<HistoryPage, StudioError> {
        self.history().load().await
    }

    pub async fn clear_history(&self) -> Result<(), StudioError> {
        self.history().clear().await
    }

    /// Delete an artifact, its history records and its favourite mark.
    pub async fn delete_artifact(&self, record: &HistoryRecord) -> Result<DeleteOutcome, StudioError> {
        let outcome = self.history().delete_artifact(record).await?;
        if let Err(e) = self.favourites.forget(&record.filename).await {
            tracing::warn!(filename = %record.filename, error = %e, "Failed to update favourites");
        }
        Ok(outcome)
    }

    // ---- backend ----

    /// `Ok` when the backend answers `/system_stats`.
    pub async fn check_connection(&self) -> Result<(), StudioError> {
        let backend = self.backend.current().await;
        backend.system_stats().await?;
        Ok(())
    }

    pub async fn list_options(&self, kind: OptionKind) -> Result<Vec<String>, StudioError> {
        let (node_type, field) = kind.source();
        let backend = self.backend.current().await;
        Ok(backend.object_info_options(node_type, field).await?)
    }

    /// Point everything at a new backend address.
    ///
    /// The old push channel is fully closed before the new one opens.
    pub async fn set_server_address(&self, server_url: &str) -> Result<(), StudioError> {
        let server_url = server_url.trim();
        if server_url.is_empty() {
            return Err(StudioError::Validation("Server address is empty".to_string()));
        }

        let previous = self.push.lock().await.take();
        let had_push = previous.is_some();
        if let Some(channel) = previous {
            channel.close().await;
        }

        self.backend
            .replace(Arc::new(ComfyUIApi::new(server_url.to_string())))
            .await;
        tracing::info!(server = %server_url, "Backend address changed");

        if had_push {
            self.open_push(server_url).await;
        }
        Ok(())
    }

    /// Close the push channel and stop background work.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down studio session");
        let channel = self.push.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.controller.shutdown().await;
        tracing::info!("Studio session shut down complete");
    }

    // ---- private helpers ----

    async fn open_push(&self, server_url: &str) {
        let channel = PushChannel::open(server_url, Arc::clone(&self.controller));
        let previous = self.push.lock().await.replace(channel);
        if let Some(previous) = previous {
            tracing::warn!(server = %previous.server_url(), "Closing unexpected previous push channel");
            previous.close().await;
        }
    }
}
