use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the dispatch crates.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the routing engine and its admin API.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Malformed or duplicate admin input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A delete was blocked because other records still depend on the target.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Unknown id, or no model satisfies the requested capability.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The winning rule's targets and fallback are all ineligible.
    #[error("No eligible model: {0}")]
    NoEligibleModel(String),

    /// Health-probe I/O failure. Converted into a health classification
    /// before it can reach routing callers.
    #[error("Probe failed: {0}")]
    Probe(String),

    /// Performance snapshot recomputation failure. Logged and swallowed.
    #[error("Feedback recomputation failed: {0}")]
    Feedback(String),

    /// The caller's deadline passed before routing finished.
    #[error("Deadline exceeded during {stage}")]
    DeadlineExceeded { stage: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for DispatchError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {err}"))
    }
}

/// Broad classification used when deciding how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// The request or admin input was wrong; retrying unchanged will not help.
    Client,
    /// Routing could not find a live backend right now; retry later.
    Routing,
    /// A provider or background job failed.
    Upstream,
    /// Storage or other internal failure.
    Internal,
}

impl DispatchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Conflict(_) | Self::NotFound(_) => ErrorCategory::Client,
            Self::NoEligibleModel(_) | Self::DeadlineExceeded { .. } => ErrorCategory::Routing,
            Self::Probe(_) | Self::Feedback(_) => ErrorCategory::Upstream,
            Self::Storage(_) => ErrorCategory::Internal,
        }
    }

    /// Whether calling again later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Routing | ErrorCategory::Upstream
        )
    }

    /// Returns a user-facing message (hides storage internals).
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("Invalid input: {msg}"),
            Self::Conflict(msg) => format!("Cannot delete: {msg}"),
            Self::NotFound(msg) => format!("Not found: {msg}"),
            Self::NoEligibleModel(_) => {
                "No model is currently available for this request. Try again shortly.".into()
            }
            Self::Probe(msg) => format!("Provider health check failed: {msg}"),
            Self::Feedback(_) => "Performance statistics could not be refreshed.".into(),
            Self::DeadlineExceeded { .. } => "Routing timed out.".into(),
            Self::Storage(_) => "Storage error. Check the database file and permissions.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            DispatchError::Validation("x".into()).category(),
            ErrorCategory::Client
        );
        assert_eq!(
            DispatchError::Conflict("x".into()).category(),
            ErrorCategory::Client
        );
        assert_eq!(
            DispatchError::NoEligibleModel("x".into()).category(),
            ErrorCategory::Routing
        );
        assert_eq!(
            DispatchError::Feedback("x".into()).category(),
            ErrorCategory::Upstream
        );
        assert_eq!(
            DispatchError::Storage("x".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn retryable_only_for_transient_failures() {
        assert!(DispatchError::NoEligibleModel("all down".into()).is_retryable());
        assert!(
            DispatchError::DeadlineExceeded {
                stage: "registry".into()
            }
            .is_retryable()
        );
        assert!(!DispatchError::Validation("bad".into()).is_retryable());
        assert!(!DispatchError::Storage("disk".into()).is_retryable());
    }

    #[test]
    fn storage_message_hides_details() {
        let err = DispatchError::Storage("SQLITE_CORRUPT at page 7".into());
        assert!(!err.user_message().contains("page 7"));
        assert!(err.to_string().contains("page 7"));
    }

    #[test]
    fn rusqlite_error_converts_to_storage() {
        let err: DispatchError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, DispatchError::Storage(_)));
    }

    #[test]
    fn deadline_display_names_stage() {
        let err = DispatchError::DeadlineExceeded {
            stage: "health lookup".into(),
        };
        assert_eq!(err.to_string(), "Deadline exceeded during health lookup");
    }
}
