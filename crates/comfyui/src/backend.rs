//! The backend gateway seam.
//!
//! [`Backend`] is everything the session layer needs from a ComfyUI
//! server. [`ComfyUIApi`](crate::api::ComfyUIApi) is the HTTP
//! implementation; tests substitute an in-memory one.

use async_trait::async_trait;

use crate::api::{ComfyUIApiError, SubmitResponse};

#[async_trait]
pub trait Backend: Send + Sync {
    /// Base HTTP URL, e.g. `http://host:8188`, without a trailing slash.
    fn base_url(&self) -> &str;

    /// `POST /upload/image`. Returns the name to reference from a
    /// `LoadImage` node (prefixed with its subfolder, if any).
    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        overwrite: bool,
    ) -> Result<String, ComfyUIApiError>;

    /// `POST /prompt`.
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// `GET /history/{prompt_id}`. `{}` until the prompt has finished.
    async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError>;

    /// `POST /interrupt`. Not tied to a prompt.
    async fn interrupt(&self) -> Result<(), ComfyUIApiError>;

    /// Drop `prompt_id` from the queue (`POST /queue {"delete": [..]}`)
    /// and stop it if it is the one running (`POST /interrupt {"prompt_id"}`).
    /// Leaves other clients' prompts alone.
    async fn cancel_prompt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;

    /// `POST /free`.
    async fn free_memory(&self, unload_models: bool, free_memory: bool)
        -> Result<(), ComfyUIApiError>;

    /// Choices for one combo input of a node type, via `GET /object_info/{node_type}`.
    async fn object_info_options(
        &self,
        node_type: &str,
        input: &str,
    ) -> Result<Vec<String>, ComfyUIApiError>;

    /// `GET /system_stats`; success means the server is reachable.
    async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError>;

    /// `GET /userdata/{file}.json`. A 404 yields `None`.
    async fn read_userdata(&self, file: &str)
        -> Result<Option<serde_json::Value>, ComfyUIApiError>;

    /// `POST /userdata/{file}.json`, replacing the whole file.
    async fn write_userdata(
        &self,
        file: &str,
        data: &serde_json::Value,
    ) -> Result<(), ComfyUIApiError>;

    /// Remove a generated file from the server.
    async fn delete_output(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<(), ComfyUIApiError>;
}
