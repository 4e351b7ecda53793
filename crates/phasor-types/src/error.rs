use thiserror::Error;

/// Errors from state store operations (trait defined in phasor-core).
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// Underlying read or write failed. Callers treat the individual write as
    /// fatal but may retry at the next natural save point.
    #[error("state I/O error: {0}")]
    Io(String),

    /// The persisted payload failed validation and no backup could be
    /// recovered. Current state has been cleared; in-flight progress is lost.
    #[error("state corruption: {0}")]
    Corruption(String),

    /// Serialization of run state failed.
    #[error("state serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StateStoreError {
    fn from(e: std::io::Error) -> Self {
        StateStoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StateStoreError {
    fn from(e: serde_json::Error) -> Self {
        StateStoreError::Serialization(e.to_string())
    }
}

/// Errors from capability provider invocations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider or external service is not resolvable.
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    /// The provider ran and reported a failure.
    #[error("provider '{provider}' action '{action}' failed: {message}")]
    Invocation {
        provider: String,
        action: String,
        message: String,
    },

    /// A rollback revert request failed.
    #[error("revert failed for provider '{provider}': {message}")]
    RevertFailed { provider: String, message: String },
}
