//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI server. Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`] over WebSocket.

use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// The raw WebSocket stream type used for ComfyUI push messages.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI push channel.
///
/// The client ID is fixed for the life of the client; the same ID must
/// be sent with every `/prompt` submission so the server routes
/// progress for those prompts to this socket.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    client_id: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: WsStream,
}

impl ComfyUIConnection {
    /// Send a close frame and wait for the server to acknowledge it.
    pub async fn close(&mut self) {
        if let Err(e) = self.ws_stream.close(None).await {
            tracing::debug!(error = %e, "Error while closing ComfyUI WebSocket");
        }
    }
}

impl ComfyUIClient {
    /// Create a client for the server at `server_url`.
    ///
    /// * `server_url` - HTTP base URL, e.g. `http://host:8188`.
    /// * `client_id`  - ID shared with prompt submission.
    pub fn new(server_url: &str, client_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url_for(server_url),
            client_id: client_id.into(),
        }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, self.client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %self.client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id: self.client_id.clone(),
            ws_stream,
        })
    }
}

/// Map an HTTP server address to its WebSocket equivalent.
///
/// `http` becomes `ws`, `https` becomes `wss`, and a bare `host:port`
/// is treated as plain `ws`.
pub fn ws_url_for(server_url: &str) -> String {
    let trimmed = server_url.trim().trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_maps_to_ws() {
        assert_eq!(ws_url_for("http://192.168.1.5:8188/"), "ws://192.168.1.5:8188");
    }

    #[test]
    fn https_maps_to_wss() {
        assert_eq!(ws_url_for("https://comfy.example.com"), "wss://comfy.example.com");
    }

    #[test]
    fn bare_host_gets_ws_scheme() {
        assert_eq!(ws_url_for("localhost:8188"), "ws://localhost:8188");
    }

    #[test]
    fn client_keeps_its_id() {
        let client = ComfyUIClient::new("http://localhost:8188", "fixed-id");
        assert_eq!(client.client_id(), "fixed-id");
        assert_eq!(client.ws_url(), "ws://localhost:8188");
    }
}
