//! Events emitted by the session layer.
//!
//! These are what a UI listens to. They are produced by the controller
//! and the push-channel supervisor after interpreting raw backend
//! messages.

use serde::Serialize;
use studio_core::history::HistoryEntry;
use studio_core::templates::Phase;

use crate::reconciler::GenerationStatus;

/// A session-level change a UI may want to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    /// The push channel connected to `server`.
    Connected { server: String },

    /// The push channel dropped; it reconnects on its own.
    Disconnected { server: String },

    /// The generation status moved.
    StatusChanged {
        status: GenerationStatus,
        prompt_id: Option<String>,
    },

    /// Step-level progress for the active prompt.
    Progress {
        prompt_id: Option<String>,
        /// Completion percentage (0-100).
        percent: u8,
    },

    /// A well-known node started; coarse label for the progress bar.
    PhaseChanged { prompt_id: Option<String>, phase: Phase },

    /// The artifact was resolved and recorded in history.
    Finished { entry: HistoryEntry },

    /// The session ended in Error, or finished without a retrievable
    /// artifact.
    Failed {
        prompt_id: Option<String>,
        /// User-facing description.
        message: String,
    },
}
