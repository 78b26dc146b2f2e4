//! ComfyUI WebSocket and REST client library.
//!
//! Provides the [`Backend`](backend::Backend) gateway trait with its
//! HTTP implementation, typed push-message parsing, WebSocket
//! connection management and reconnection logic.

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod processor;
pub mod reconnect;

pub use api::{ComfyUIApi, ComfyUIApiError, SubmitResponse};
pub use backend::Backend;
pub use messages::ComfyUIMessage;
