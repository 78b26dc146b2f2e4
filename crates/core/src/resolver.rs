//! Locate the produced artifact in a finished job's history entry.
//!
//! The history endpoint returns `{ "<prompt_id>": { "outputs": { "<node>":
//! { "images": [...] | "gifs": [...] } } } }`. The expected output node is
//! tried first; if it has nothing, every node is scanned in ID order so a
//! drifted node ID in a custom template still yields its file.

use serde::{Deserialize, Serialize};

use crate::error::StudioError;
use crate::params::GenerationMode;
use crate::templates::output_node;

/// Still image or video clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Guess from a filename extension.
    pub fn from_filename(filename: &str) -> Self {
        let lower = filename.to_ascii_lowercase();
        if [".mp4", ".webm", ".mov", ".mkv", ".gif"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Self::Video
        } else {
            Self::Image
        }
    }
}

/// One output file entry as it appears in the history payload.
#[derive(Debug, Clone, Deserialize)]
struct OutputFile {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    folder_type: String,
    #[serde(default)]
    format: Option<String>,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// The located artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub node_id: String,
    pub filename: String,
    pub subfolder: String,
    /// Backend folder kind (`output`, `temp`, `input`).
    pub folder_type: String,
    pub media: MediaKind,
}

/// The entry for `prompt_id` inside a `/history/{prompt_id}` response.
///
/// Returns `None` while the backend has not finished the prompt (it
/// answers `{}` until then).
pub fn history_entry<'a>(
    response: &'a serde_json::Value,
    prompt_id: &str,
) -> Option<&'a serde_json::Value> {
    response.get(prompt_id).filter(|entry| entry.is_object())
}

/// Find the artifact produced by a finished job.
pub fn resolve_artifact(
    entry: &serde_json::Value,
    mode: GenerationMode,
    extend: bool,
) -> Result<ArtifactRef, StudioError> {
    let outputs = entry
        .get("outputs")
        .and_then(|o| o.as_object())
        .ok_or_else(|| StudioError::NotFound("history entry has no outputs".to_string()))?;

    let expected = output_node(mode, extend);
    if let Some(artifact) = outputs.get(expected).and_then(|node| first_file(expected, node)) {
        return Ok(artifact);
    }

    let fallback = outputs
        .iter()
        .filter(|(id, _)| id.as_str() != expected)
        .find_map(|(id, node)| first_file(id, node));

    match fallback {
        Some(artifact) => {
            tracing::debug!(
                expected,
                found = %artifact.node_id,
                "Expected output node empty, using fallback node",
            );
            Ok(artifact)
        }
        None => Err(StudioError::NotFound(format!(
            "no node produced an image or video (expected node {expected})"
        ))),
    }
}

/// First entry of the first non-empty list among `images` and `gifs`.
fn first_file(node_id: &str, node: &serde_json::Value) -> Option<ArtifactRef> {
    ["images", "gifs"].iter().find_map(|key| {
        let list = node.get(*key)?.as_array()?;
        let file = list
            .iter()
            .find_map(|item| serde_json::from_value::<OutputFile>(item.clone()).ok())?;

        let media = match file.format.as_deref() {
            Some(format) if format.starts_with("video/") || format.starts_with("image/gif") => {
                MediaKind::Video
            }
            Some(format) if format.starts_with("image/") => MediaKind::Image,
            _ => MediaKind::from_filename(&file.filename),
        };

        Some(ArtifactRef {
            node_id: node_id.to_string(),
            filename: file.filename,
            subfolder: file.subfolder,
            folder_type: file.folder_type,
            media,
        })
    })
}
