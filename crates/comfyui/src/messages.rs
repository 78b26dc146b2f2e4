//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum.
//!
//! Several payloads carry `prompt_id` only on newer servers, so it is
//! optional wherever older builds omit it.

use serde::Deserialize;

/// All known ComfyUI WebSocket message types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// The whole prompt completed.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(ExecutionSuccessData),

    /// Execution was stopped by `/interrupt`.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

impl ComfyUIMessage {
    /// The prompt this message is about, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::ExecutionStart(d) => Some(&d.prompt_id),
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => d.prompt_id.as_deref(),
            Self::ExecutionSuccess(d) => Some(&d.prompt_id),
            Self::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Progress(_) => "progress",
            Self::Executed(_) => "executed",
            Self::ExecutionSuccess(_) => "execution_success",
            Self::ExecutionInterrupted(_) => "execution_interrupted",
            Self::ExecutionError(_) => "execution_error",
        }
    }
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Session ID the server assigned, sent on first connect.
    #[serde(default)]
    pub sid: Option<String>,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: u64,
    /// Total number of steps.
    pub max: u64,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Whole-number percentage, rounded down. Zero when `max` is zero.
    pub fn percent(&self) -> u8 {
        if self.max == 0 {
            return 0;
        }
        (self.value.min(self.max) * 100 / self.max) as u8
    }
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `execution_success` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSuccessData {
    pub prompt_id: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

impl ErrorData {
    /// Text to show the user.
    pub fn message(&self) -> String {
        let message = self.exception_message.trim();
        match (message.is_empty(), self.node_type.as_deref()) {
            (true, Some(node_type)) => format!("{node_type} failed"),
            (true, None) => "Execution failed".to_string(),
            (false, _) => message.to_string(),
        }
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_message() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":3}},"sid":"s1"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::Status(data) => {
                assert_eq!(data.status.exec_info.queue_remaining, 3);
                assert_eq!(data.sid.as_deref(), Some("s1"));
            }
            other => panic!("Expected Status, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_cached_without_nodes() {
        let json = r#"{"type":"execution_cached","data":{"prompt_id":"abc"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::ExecutionCached(data) => {
                assert_eq!(data.prompt_id, "abc");
                assert!(data.nodes.is_empty());
            }
            other => panic!("Expected ExecutionCached, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_with_node() {
        let json = r#"{"type":"executing","data":{"node":"42","display_node":"42","prompt_id":"xyz"}}"#;
        let msg = parse_message(json).unwrap();
        assert_eq!(msg.prompt_id(), Some("xyz"));
        match msg {
            ComfyUIMessage::Executing(data) => assert_eq!(data.node.as_deref(), Some("42")),
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_executing_without_prompt_id() {
        let json = r#"{"type":"executing","data":{"node":null}}"#;
        let msg = parse_message(json).unwrap();
        assert!(msg.prompt_id().is_none());
        match msg {
            ComfyUIMessage::Executing(data) => assert!(data.node.is_none()),
            other => panic!("Expected Executing, got {other:?}"),
        }
    }

    #[test]
    fn parse_progress_and_percent() {
        let json = r#"{"type":"progress","data":{"value":7,"max":20,"prompt_id":"p","node":"3"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::Progress(data) => {
                assert_eq!(data.percent(), 35);
                assert_eq!(data.node.as_deref(), Some("3"));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }

        let zero = ProgressData {
            value: 3,
            max: 0,
            prompt_id: None,
            node: None,
        };
        assert_eq!(zero.percent(), 0);
    }

    #[test]
    fn percent_rounds_down() {
        let data = ProgressData {
            value: 2,
            max: 3,
            prompt_id: None,
            node: None,
        };
        assert_eq!(data.percent(), 66);
    }

    #[test]
    fn parse_execution_success() {
        let json = r#"{"type":"execution_success","data":{"prompt_id":"abc123","timestamp":1}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::ExecutionSuccess(data) => assert_eq!(data.prompt_id, "abc123"),
            other => panic!("Expected ExecutionSuccess, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_with_sparse_payload() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"p","node_type":"KSampler"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::ExecutionError(data) => {
                assert!(data.node_id.is_none());
                assert_eq!(data.message(), "KSampler failed");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_execution_error_message() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"3",
            "exception_message":"CUDA out of memory","exception_type":"RuntimeError"}}"#;
        match parse_message(json).unwrap() {
            ComfyUIMessage::ExecutionError(data) => {
                assert_eq!(data.message(), "CUDA out of memory");
                assert_eq!(data.node_id.as_deref(), Some("3"));
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type_fails() {
        assert!(parse_message(r#"{"type":"crystools.monitor","data":{}}"#).is_err());
    }

    #[test]
    fn parse_malformed_json_fails() {
        assert!(parse_message("not json").is_err());
    }
}
