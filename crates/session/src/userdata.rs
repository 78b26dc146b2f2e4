//! Collections kept in the backend's user-data store.
//!
//! The store only offers whole-file reads and writes, so every mutation
//! here is read-modify-write of the full list. Concurrent writers from
//! other clients can lose updates; the last write wins.

use serde::{Deserialize, Serialize};
use studio_core::types::{now_millis, EpochMillis};
use studio_core::StudioError;

use crate::handle::BackendHandle;

/// One `/userdata/{name}.json` file holding a JSON array.
#[derive(Clone)]
pub struct UserDataFile {
    backend: BackendHandle,
    name: String,
}

impl UserDataFile {
    pub fn new(backend: BackendHandle, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw items for display. A missing file is an empty list, and so is
    /// a file that does not hold a list.
    pub async fn read_items(&self) -> Result<Vec<serde_json::Value>, StudioError> {
        match self.fetch().await? {
            Ok(items) => Ok(items),
            Err(kind) => {
                tracing::warn!(
                    file = %self.name,
                    kind,
                    "User-data file is not a list, treating as empty",
                );
                Ok(Vec::new())
            }
        }
    }

    /// Raw items ahead of a [`write_items`](Self::write_items). Fails on a
    /// file that does not hold a list, so it is never overwritten.
    pub async fn read_items_for_update(&self) -> Result<Vec<serde_json::Value>, StudioError> {
        self.fetch().await?.map_err(|kind| {
            StudioError::Validation(format!(
                "User-data file {} holds a {kind}, not a list; leaving it untouched",
                self.name
            ))
        })
    }

    /// Inner `Err` carries the JSON kind of a non-list file.
    async fn fetch(&self) -> Result<Result<Vec<serde_json::Value>, &'static str>, StudioError> {
        let backend = self.backend.current().await;
        Ok(match backend.read_userdata(&self.name).await? {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(serde_json::Value::Array(items)) => Ok(items),
            Some(other) => Err(json_kind(&other)),
        })
    }

    /// Replace the whole file.
    pub async fn write_items(&self, items: &[serde_json::Value]) -> Result<(), StudioError> {
        let backend = self.backend.current().await;
        backend
            .write_userdata(&self.name, &serde_json::Value::Array(items.to_vec()))
            .await?;
        tracing::debug!(file = %self.name, count = items.len(), "User-data file written");
        Ok(())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/* --------------------------------------------------------------------------
Saved prompts
-------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedPrompt {
    pub text: String,
    #[serde(default)]
    pub saved_at: EpochMillis,
}

/// Prompts the user kept for reuse, newest first, without duplicates.
pub struct PromptLibrary {
    file: UserDataFile,
}

impl PromptLibrary {
    pub fn new(file: UserDataFile) -> Self {
        Self { file }
    }

    pub async fn list(&self) -> Result<Vec<SavedPrompt>, StudioError> {
        Ok(decode_prompts(self.file.read_items().await?))
    }

    /// Returns `false` when an identical prompt is already saved.
    pub async fn add(&self, text: &str) -> Result<bool, StudioError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StudioError::Validation("Prompt is empty".to_string()));
        }

        let mut prompts = self.list_for_update().await?;
        if prompts.iter().any(|p| p.text == text) {
            return Ok(false);
        }
        prompts.insert(
            0,
            SavedPrompt {
                text: text.to_string(),
                saved_at: now_millis(),
            },
        );
        self.save(&prompts).await?;
        Ok(true)
    }

    /// Returns `false` when nothing matched.
    pub async fn remove(&self, text: &str) -> Result<bool, StudioError> {
        let mut prompts = self.list_for_update().await?;
        let before = prompts.len();
        prompts.retain(|p| p.text != text);
        if prompts.len() == before {
            return Ok(false);
        }
        self.save(&prompts).await?;
        Ok(true)
    }

    async fn list_for_update(&self) -> Result<Vec<SavedPrompt>, StudioError> {
        Ok(decode_prompts(self.file.read_items_for_update().await?))
    }

    async fn save(&self, prompts: &[SavedPrompt]) -> Result<(), StudioError> {
        let items = prompts
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StudioError::Validation(format!("Cannot encode prompt: {e}")))?;
        self.file.write_items(&items).await
    }
}

/// Accepts both `{text, savedAt}` objects and bare strings.
fn decode_prompts(items: Vec<serde_json::Value>) -> Vec<SavedPrompt> {
    items
        .into_iter()
        .filter_map(|item| match item {
            serde_json::Value::String(text) => Some(SavedPrompt { text, saved_at: 0 }),
            other => serde_json::from_value(other).ok(),
        })
        .collect()
}

/* --------------------------------------------------------------------------
Favourites
-------------------------------------------------------------------------- */

/// Filenames the user starred.
pub struct Favourites {
    file: UserDataFile,
}

impl Favourites {
    pub fn new(file: UserDataFile) -> Self {
        Self { file }
    }

    pub async fn list(&self) -> Result<Vec<String>, StudioError> {
        Ok(decode_filenames(self.file.read_items().await?))
    }

    pub async fn contains(&self, filename: &str) -> Result<bool, StudioError> {
        Ok(self.list().await?.iter().any(|f| f == filename))
    }

    /// Add or remove `filename`; returns whether it is now a favourite.
    pub async fn toggle(&self, filename: &str) -> Result<bool, StudioError> {
        let mut favourites = decode_filenames(self.file.read_items_for_update().await?);
        let now_favourite = match favourites.iter().position(|f| f == filename) {
            Some(index) => {
                favourites.remove(index);
                false
            }
            None => {
                favourites.insert(0, filename.to_string());
                true
            }
        };
        self.write(&favourites).await?;
        Ok(now_favourite)
    }

    /// Drop `filename` if present. Used when its artifact is deleted.
    pub async fn forget(&self, filename: &str) -> Result<(), StudioError> {
        let mut favourites = decode_filenames(self.file.read_items_for_update().await?);
        let before = favourites.len();
        favourites.retain(|f| f != filename);
        if favourites.len() != before {
            self.write(&favourites).await?;
        }
        Ok(())
    }

    async fn write(&self, favourites: &[String]) -> Result<(), StudioError> {
        let items: Vec<serde_json::Value> = favourites
            .iter()
            .map(|f| serde_json::Value::String(f.clone()))
            .collect();
        self.file.write_items(&items).await
    }
}

fn decode_filenames(items: Vec<serde_json::Value>) -> Vec<String> {
    items
        .into_iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect()
}
