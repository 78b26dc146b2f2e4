//! The shared generation history log.
//!
//! Persisted as one user-data file, newest first. Display URLs are
//! rebuilt from the current backend address on every load.

use serde::Serialize;
use studio_comfyui::api::view_url;
use studio_core::history::{HistoryEntry, HistoryRecord};
use studio_core::StudioError;

use crate::handle::BackendHandle;
use crate::userdata::UserDataFile;

/// Result of [`SessionHistoryStore::load`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    /// Items present in the file that could not be decoded.
    pub skipped: usize,
}

/// What happened to the file behind a deleted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeleteOutcome {
    /// The backend removed the file.
    Deleted,
    /// The backend no longer had the file; only the record was dropped.
    AlreadyMissing,
}

#[derive(Clone)]
pub struct SessionHistoryStore {
    backend: BackendHandle,
    file: UserDataFile,
}

impl SessionHistoryStore {
    pub fn new(backend: BackendHandle, file_name: impl Into<String>) -> Self {
        let file = UserDataFile::new(backend.clone(), file_name);
        Self { backend, file }
    }

    /// Fetch the log and attach a display URL to every decodable record.
    pub async fn load(&self) -> Result<HistoryPage, StudioError> {
        let items = self.file.read_items().await?;
        let base_url = self.backend.base_url().await;

        let mut page = HistoryPage::default();
        for item in items {
            let record = match serde_json::from_value::<HistoryRecord>(item) {
                Ok(record) => record,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping undecodable history item");
                    page.skipped += 1;
                    continue;
                }
            };
            match build_entry(&base_url, record) {
                Ok(entry) => page.entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping history item with unusable filename");
                    page.skipped += 1;
                }
            }
        }

        if page.skipped > 0 {
            tracing::warn!(
                file = %self.file.name(),
                skipped = page.skipped,
                "Some history items could not be loaded",
            );
        }
        Ok(page)
    }

    /// Prepend `record` and write the whole log back.
    ///
    /// Items this version cannot decode are kept as they are.
    pub async fn append(&self, record: &HistoryRecord) -> Result<HistoryEntry, StudioError> {
        let mut items = self.file.read_items_for_update().await?;
        let value = serde_json::to_value(record)
            .map_err(|e| StudioError::Validation(format!("Cannot encode history record: {e}")))?;
        items.insert(0, value);
        self.file.write_items(&items).await?;

        tracing::info!(
            prompt_id = %record.id,
            filename = %record.filename,
            total = items.len(),
            "History record appended",
        );

        self.entry_for(record.clone()).await
    }

    /// Attach the display URL for the current backend address.
    pub async fn entry_for(&self, record: HistoryRecord) -> Result<HistoryEntry, StudioError> {
        let base_url = self.backend.base_url().await;
        build_entry(&base_url, record)
    }

    pub async fn clear(&self) -> Result<(), StudioError> {
        self.file.write_items(&[]).await?;
        tracing::info!(file = %self.file.name(), "History cleared");
        Ok(())
    }

    /// Delete the artifact on the backend, then drop every record with
    /// the same filename.
    ///
    /// A file the backend no longer has is not an error: the record is
    /// still dropped and [`DeleteOutcome::AlreadyMissing`] returned.
    pub async fn delete_artifact(&self, record: &HistoryRecord) -> Result<DeleteOutcome, StudioError> {
        let mut items = self.file.read_items_for_update().await?;
        let backend = self.backend.current().await;
        let outcome = match backend
            .delete_output(&record.filename, &record.subfolder, &record.folder_type)
            .await
        {
            Ok(()) => DeleteOutcome::Deleted,
            Err(e) if e.is_not_found() => {
                let stale = StudioError::StaleArtifact {
                    filename: record.filename.clone(),
                };
                tracing::warn!(error = %stale, "Dropping record for missing artifact");
                DeleteOutcome::AlreadyMissing
            }
            Err(e) => return Err(e.into()),
        };

        let before = items.len();
        items.retain(|item| {
            item.get("filename").and_then(|f| f.as_str()) != Some(record.filename.as_str())
        });
        if items.len() != before {
            self.file.write_items(&items).await?;
        }

        tracing::info!(
            filename = %record.filename,
            removed = before - items.len(),
            ?outcome,
            "Artifact deleted",
        );
        Ok(outcome)
    }
}

fn build_entry(base_url: &str, record: HistoryRecord) -> Result<HistoryEntry, StudioError> {
    let image_url = view_url(
        base_url,
        &record.filename,
        &record.subfolder,
        &record.folder_type,
        record.timestamp,
    )?;
    Ok(HistoryEntry { record, image_url })
}
