//! WebSocket message processing loop.
//!
//! Reads raw frames from a ComfyUI WebSocket connection, parses them
//! into typed [`ComfyUIMessage`] variants and forwards them, in arrival
//! order, to a single consumer.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::client::WsStream;
use crate::messages::{parse_message, ComfyUIMessage};

/// Why [`process_messages`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server closed the socket or the stream failed.
    Disconnected,
    /// The consumer dropped its receiver.
    ConsumerGone,
}

/// Process WebSocket messages from a ComfyUI connection.
///
/// Loops until the WebSocket closes, encounters a fatal receive error,
/// or the consumer goes away. Binary frames (previews) are ignored.
pub async fn process_messages(
    ws_stream: &mut WsStream,
    sink: &mpsc::UnboundedSender<ComfyUIMessage>,
) -> StreamEnd {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Some(msg) = decode_text(&text) {
                    if sink.send(msg).is_err() {
                        return StreamEnd::ConsumerGone;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }
    StreamEnd::Disconnected
}

/// Parse one text frame, logging and dropping anything unrecognised.
pub fn decode_text(text: &str) -> Option<ComfyUIMessage> {
    match parse_message(text) {
        Ok(msg) => {
            tracing::trace!(kind = msg.kind(), prompt_id = ?msg.prompt_id(), "Push message");
            Some(msg)
        }
        Err(e) => {
            tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised ComfyUI message");
            None
        }
    }
}
