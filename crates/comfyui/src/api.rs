//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps upload, submission, history, interruption, memory release,
//! node schema lookups and the user-data store using [`reqwest`].

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use studio_core::StudioError;

use crate::backend::Backend;

/// Path of the delete endpoint exposed by the mobile companion extension.
const DELETE_PATH: &str = "/mobile/delete";

/// HTTP client for a single ComfyUI server.
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Body of a successful `/upload/image` call.
#[derive(Debug, Deserialize)]
struct UploadResponse {
    name: String,
    #[serde(default)]
    subfolder: String,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A URL could not be assembled from the configured server address.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl ComfyUIApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// The backend's own error text when it sent one, otherwise the
    /// display form of the error.
    pub fn user_message(&self) -> String {
        match self {
            Self::ApiError { status, body } => {
                let detail = serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.pointer("/error/message")
                            .or_else(|| v.get("error"))
                            .and_then(|m| m.as_str().map(str::to_string))
                    })
                    .unwrap_or_else(|| body.clone());
                format!("Server returned {status}: {detail}")
            }
            other => other.to_string(),
        }
    }
}

impl From<ComfyUIApiError> for StudioError {
    fn from(err: ComfyUIApiError) -> Self {
        StudioError::Transport(err.user_message())
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI server.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        Self { client, api_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for ComfyUIApi {
    fn base_url(&self) -> &str {
        &self.api_url
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        overwrite: bool,
    ) -> Result<String, ComfyUIApiError> {
        let part = multipart::Part::bytes(bytes).file_name(filename.to_string());
        let form = multipart::Form::new()
            .part("image", part)
            .text("type", "input")
            .text("overwrite", if overwrite { "true" } else { "false" });

        let response = self
            .client
            .post(self.url("/upload/image"))
            .multipart(form)
            .send()
            .await?;

        let uploaded: UploadResponse = Self::parse_response(response).await?;
        tracing::debug!(name = %uploaded.name, subfolder = %uploaded.subfolder, "Image uploaded");

        Ok(if uploaded.subfolder.is_empty() {
            uploaded.name
        } else {
            format!("{}/{}", uploaded.subfolder, uploaded.name)
        })
    }

    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. The client ID must match the one used for the push
    /// channel, otherwise progress messages go to another client.
    async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(self.url("/prompt"))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(self.url(&format!("/history/{prompt_id}")))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self.client.post(self.url("/interrupt")).send().await?;
        Self::check_status(response).await
    }

    async fn cancel_prompt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(self.url("/queue"))
            .json(&serde_json::json!({ "delete": [prompt_id] }))
            .send()
            .await?;
        Self::check_status(response).await?;

        let response = self
            .client
            .post(self.url("/interrupt"))
            .json(&serde_json::json!({ "prompt_id": prompt_id }))
            .send()
            .await?;
        Self::check_status(response).await
    }

    async fn free_memory(
        &self,
        unload_models: bool,
        free_memory: bool,
    ) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "unload_models": unload_models,
            "free_memory": free_memory,
        });
        let response = self.client.post(self.url("/free")).json(&body).send().await?;
        Self::check_status(response).await
    }

    async fn object_info_options(
        &self,
        node_type: &str,
        input: &str,
    ) -> Result<Vec<String>, ComfyUIApiError> {
        let response = self
            .client
            .get(self.url(&format!("/object_info/{node_type}")))
            .send()
            .await?;
        let info: serde_json::Value = Self::parse_response(response).await?;
        Ok(combo_options(&info, node_type, input))
    }

    async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self.client.get(self.url("/system_stats")).send().await?;
        Self::parse_response(response).await
    }

    async fn read_userdata(
        &self,
        file: &str,
    ) -> Result<Option<serde_json::Value>, ComfyUIApiError> {
        let response = self
            .client
            .get(self.url(&format!("/userdata/{file}.json")))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::parse_response(response).await.map(Some)
    }

    async fn write_userdata(
        &self,
        file: &str,
        data: &serde_json::Value,
    ) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(self.url(&format!("/userdata/{file}.json")))
            .query(&[("overwrite", "true")])
            .json(data)
            .send()
            .await?;

        Self::check_status(response).await
    }

    async fn delete_output(
        &self,
        filename: &str,
        subfolder: &str,
        folder_type: &str,
    ) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "filename": filename,
            "subfolder": subfolder,
            "type": folder_type,
        });
        let response = self.client.post(self.url(DELETE_PATH)).json(&body).send().await?;
        Self::check_status(response).await
    }
}

/// Read `[node_type].input.required[input]` from an `/object_info` body.
///
/// Handles both the legacy `[[...choices], {...}]` shape and the newer
/// `["COMBO", {"options": [...]}]` shape.
pub fn combo_options(info: &serde_json::Value, node_type: &str, input: &str) -> Vec<String> {
    let Some(spec) = info
        .get(node_type)
        .and_then(|n| n.pointer("/input/required"))
        .and_then(|r| r.get(input))
    else {
        return Vec::new();
    };

    let choices = spec
        .get(0)
        .and_then(|c| c.as_array())
        .or_else(|| spec.pointer("/1/options").and_then(|o| o.as_array()));

    choices
        .map(|list| {
            list.iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Build a `/view` URL for a stored file.
///
/// `cache_buster` goes into `t`; the backend ignores it.
pub fn view_url(
    base_url: &str,
    filename: &str,
    subfolder: &str,
    folder_type: &str,
    cache_buster: i64,
) -> Result<String, ComfyUIApiError> {
    let base = format!("{}/view", base_url.trim_end_matches('/'));
    let t = cache_buster.to_string();
    Url::parse_with_params(
        &base,
        &[
            ("filename", filename),
            ("type", folder_type),
            ("subfolder", subfolder),
            ("t", t.as_str()),
        ],
    )
    .map(String::from)
    .map_err(|e| ComfyUIApiError::InvalidUrl(format!("{base}: {e}")))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://host:8188/");
        assert_eq!(api.base_url(), "http://host:8188");
    }

    #[test]
    fn view_url_encodes_parameters() {
        let url = view_url("http://host:8188/", "my file.png", "mobile", "output", 42).unwrap();
        assert_eq!(
            url,
            "http://host:8188/view?filename=my+file.png&type=output&subfolder=mobile&t=42"
        );
    }

    #[test]
    fn view_url_rejects_garbage_base() {
        assert_matches!(
            view_url("not a url", "a.png", "", "output", 1),
            Err(ComfyUIApiError::InvalidUrl(_))
        );
    }

    #[test]
    fn combo_options_legacy_shape() {
        let info = json!({"LoraLoader": {"input": {"required": {
            "lora_name": [["a.safetensors", "b.safetensors"], {}]
        }}}});
        assert_eq!(
            combo_options(&info, "LoraLoader", "lora_name"),
            vec!["a.safetensors", "b.safetensors"]
        );
    }

    #[test]
    fn combo_options_new_shape() {
        let info = json!({"LoadImage": {"input": {"required": {
            "image": ["COMBO", {"options": ["fox.png"], "image_upload": true}]
        }}}});
        assert_eq!(combo_options(&info, "LoadImage", "image"), vec!["fox.png"]);
    }

    #[test]
    fn combo_options_missing_field_is_empty() {
        assert!(combo_options(&json!({}), "LoadImage", "image").is_empty());
    }

    #[test]
    fn api_error_prefers_backend_message() {
        let err = ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error": {"type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation"}}"#.into(),
        };
        assert_eq!(err.user_message(), "Server returned 400: Prompt outputs failed validation");

        let raw = ComfyUIApiError::ApiError {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(raw.user_message(), "Server returned 500: boom");
        assert!(!raw.is_not_found());
    }

    #[test]
    fn converts_into_transport_error() {
        let err: StudioError = ComfyUIApiError::ApiError {
            status: 404,
            body: "missing".into(),
        }
        .into();
        assert_matches!(err, StudioError::Transport(msg) if msg.contains("404"));
    }
}
