//! Error taxonomy for workspace and pipeline operations.
//!
//! Storage backends and model clients return `anyhow::Result`; those errors
//! are wrapped into [`KbError::Storage`] or [`KbError::StageFailure`] at the
//! engine boundary so callers can tell client mistakes from backend faults.

/// Top-level error type for ragspace operations.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// The workspace identifier failed validation. No side effects occurred.
    #[error("invalid workspace name '{name}': {reason}")]
    InvalidWorkspaceName { name: String, reason: String },

    /// Storage initialization failed while constructing an engine instance.
    /// Retrying later may succeed.
    #[error("failed to initialize workspace '{workspace}': {message}")]
    InstanceInitializationFailed { workspace: String, message: String },

    /// Batch enqueue received a per-item list of the wrong length.
    #[error("batch size mismatch for {what}: expected {expected}, got {actual}")]
    BatchSizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// An ingestion stage failed for one document.
    #[error("{stage} stage failed for document {document_id}: {message}")]
    StageFailure {
        document_id: String,
        stage: &'static str,
        message: String,
    },

    /// The workspace has no cached engine instance.
    #[error("workspace '{0}' is not loaded")]
    InstanceNotFound(String),

    /// Submitted content is empty or whitespace only.
    #[error("document content is empty")]
    EmptyDocument,

    /// The document is currently being processed.
    #[error("document {0} is being processed; retry after it completes")]
    DocumentBusy(String),

    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A storage backend failed outside of a pipeline stage.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    pub fn invalid_workspace(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidWorkspaceName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn stage(document_id: &str, stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::StageFailure {
            document_id: document_id.to_string(),
            stage,
            message: err.to_string(),
        }
    }

    /// Errors caused by the caller's input (the 4xx class).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            KbError::InvalidWorkspaceName { .. }
                | KbError::BatchSizeMismatch { .. }
                | KbError::EmptyDocument
                | KbError::DocumentBusy(_)
                | KbError::InstanceNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let err = KbError::invalid_workspace("../etc", "contains '..'");
        assert_eq!(
            err.to_string(),
            "invalid workspace name '../etc': contains '..'"
        );

        let err = KbError::BatchSizeMismatch {
            what: "enable_graph",
            expected: 3,
            actual: 2,
        };
        assert!(err.to_string().contains("expected 3, got 2"));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(KbError::EmptyDocument.is_client_error());
        assert!(KbError::invalid_workspace("x/y", "bad").is_client_error());
        assert!(!KbError::InstanceInitializationFailed {
            workspace: "w".to_string(),
            message: "disk full".to_string(),
        }
        .is_client_error());
        assert!(!KbError::from(anyhow::anyhow!("boom")).is_client_error());
    }
}
