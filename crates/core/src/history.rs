//! Persisted history records.
//!
//! The shared log lives in the backend's user-data store as a JSON array
//! in camelCase, newest first. The display URL is never stored: the
//! backend address is a runtime setting, so the URL is rebuilt on every
//! load (see [`HistoryEntry`]).

use serde::{Deserialize, Serialize};

use crate::params::GenerationMode;
use crate::resolver::{ArtifactRef, MediaKind};
use crate::types::EpochMillis;

/// One successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    /// The backend prompt ID.
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Backend folder kind, passed back as `type=` when viewing.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
    pub media_type: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<GenerationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_filename: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub seed: u64,
    /// Completion time; doubles as the media cache-buster.
    pub timestamp: EpochMillis,
    #[serde(default)]
    pub duration_ms: i64,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl HistoryRecord {
    /// Build the record for a resolved artifact.
    #[allow(clippy::too_many_arguments)]
    pub fn from_artifact(
        prompt_id: &str,
        artifact: &ArtifactRef,
        mode: GenerationMode,
        prompt: &str,
        seed: u64,
        input_filename: Option<String>,
        submitted_at: EpochMillis,
        finished_at: EpochMillis,
    ) -> Self {
        Self {
            id: prompt_id.to_string(),
            filename: artifact.filename.clone(),
            subfolder: artifact.subfolder.clone(),
            folder_type: artifact.folder_type.clone(),
            media_type: artifact.media,
            mode: Some(mode),
            input_filename,
            prompt: prompt.to_string(),
            seed,
            timestamp: finished_at,
            duration_ms: (finished_at - submitted_at).max(0),
        }
    }
}

/// A record plus its display URL for the current backend address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub record: HistoryRecord,
    pub image_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ArtifactRef {
        ArtifactRef {
            node_id: "79".into(),
            filename: "edit_0001.png".into(),
            subfolder: "mobile".into(),
            folder_type: "output".into(),
            media: MediaKind::Image,
        }
    }

    #[test]
    fn duration_is_finish_minus_submit() {
        let record = HistoryRecord::from_artifact(
            "abc123",
            &artifact(),
            GenerationMode::Edit,
            "a red fox",
            9,
            Some("fox.png".into()),
            1_000,
            4_500,
        );
        assert_eq!(record.duration_ms, 3_500);
        assert_eq!(record.timestamp, 4_500);
        assert_eq!(record.id, "abc123");
    }

    #[test]
    fn persisted_shape_is_camel_case_without_url() {
        let record = HistoryRecord::from_artifact(
            "abc123",
            &artifact(),
            GenerationMode::Edit,
            "a red fox",
            9,
            Some("fox.png".into()),
            0,
            10,
        );
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["mediaType"], "image");
        assert_eq!(value["inputFilename"], "fox.png");
        assert_eq!(value["durationMs"], 10);
        assert_eq!(value["type"], "output");
        assert!(value.get("imageUrl").is_none());
    }

    #[test]
    fn legacy_record_without_optional_fields_loads() {
        let record: HistoryRecord = serde_json::from_value(serde_json::json!({
            "id": "p1",
            "filename": "old.png",
            "mediaType": "image",
            "timestamp": 5
        }))
        .unwrap();
        assert_eq!(record.folder_type, "output");
        assert!(record.input_filename.is_none());
        assert_eq!(record.duration_ms, 0);
    }
}
