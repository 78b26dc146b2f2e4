//! Domain model for the mobile generation studio.
//!
//! Everything here is pure: job-graph templates and the builder that
//! parameterizes them, the artifact resolver that reads finished
//! history payloads, and the persisted history record. Network and
//! session concerns live in `studio-comfyui` and `studio-session`.

pub mod builder;
pub mod error;
pub mod graph;
pub mod history;
pub mod params;
pub mod resolver;
pub mod templates;
pub mod types;

pub use error::StudioError;
