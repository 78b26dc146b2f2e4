/// Every failure a generation session can surface.
///
/// Each variant is converted into one user-facing message plus a status
/// value by the session controller; none of them reach the UI layer raw.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StudioError {
    /// A workflow template is missing a node the builder needs, or is
    /// otherwise unusable. Raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// User-supplied parameters cannot be turned into a job graph.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Upload, submit or other HTTP/WebSocket exchange with the backend failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend reported an `execution_error` for the active prompt.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The backend reported success but no output file could be located.
    #[error("Output not found: {0}")]
    NotFound(String),

    /// A persisted record points at a file the backend no longer has.
    #[error("Artifact no longer exists on the server: {filename}")]
    StaleArtifact { filename: String },
}

impl StudioError {
    /// Shorthand for the most common configuration failure.
    pub fn missing_node(template: &str, node_id: &str) -> Self {
        Self::Configuration(format!(
            "{template} template is missing required node {node_id}"
        ))
    }

    /// Text shown to the user in place of the raw error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(msg) => {
                format!("Workflow template is outdated or incompatible: {msg}")
            }
            Self::Validation(msg) => msg.clone(),
            Self::Transport(msg) => msg.clone(),
            Self::Execution(msg) => format!("Generation failed: {msg}"),
            Self::NotFound(msg) => format!("Generated but retrieval failed: {msg}"),
            Self::StaleArtifact { filename } => {
                format!("{filename} no longer exists on the server")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_node_names_the_node() {
        let err = StudioError::missing_node("edit", "89");
        assert_eq!(
            err,
            StudioError::Configuration("edit template is missing required node 89".into())
        );
        assert!(err.user_message().contains("89"));
    }

    #[test]
    fn transport_message_is_surfaced_verbatim() {
        let err = StudioError::Transport("ComfyUI API error (400): bad prompt".into());
        assert_eq!(err.user_message(), "ComfyUI API error (400): bad prompt");
    }

    #[test]
    fn not_found_reads_as_retrieval_failure() {
        let err = StudioError::NotFound("no outputs".into());
        assert!(err.user_message().starts_with("Generated but retrieval failed"));
    }
}
