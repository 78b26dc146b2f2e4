//! Generation-session lifecycle.
//!
//! Ties the pure model in `studio-core` to the backend gateway in
//! `studio-comfyui`: the completion state machine, the controller that
//! drives submissions, the history poller, push-channel supervision and
//! the user-data stores.

pub mod config;
pub mod controller;
pub mod events;
pub mod handle;
pub mod history;
pub mod manager;
pub mod poller;
pub mod push;
pub mod reconciler;
pub mod userdata;

pub use config::StudioConfig;
pub use controller::GenerationController;
pub use events::SessionEvent;
pub use manager::{OptionKind, StudioManager};
pub use reconciler::{GenerationSnapshot, GenerationStatus};
