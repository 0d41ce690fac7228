//! Crate-wide error taxonomy (spec.md §7).

/// Errors raised anywhere in the pipeline engine.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Non-zero exit, missing binary, or malformed output from an external
    /// tool (the ripper, the audio probe, a subtitle scraper).
    #[error("external binary failed: {0}")]
    ExternalBinaryFailure(String),

    /// File not ready, matcher exceeded its budget, subtitle acquisition
    /// past its deadline.
    #[error("timed out: {0}")]
    TimeoutError(String),

    /// Invalid state transition or malformed API input. Never changes
    /// persisted state.
    #[error("validation failed: {0}")]
    ValidationError(String),

    /// Entity missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unavailable path, permission denied, disk full.
    #[error("filesystem error: {0}")]
    FilesystemError(String),

    /// Transient external-service outage that survived the adapter's own
    /// retry budget.
    #[error("network error: {0}")]
    NetworkError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl IngestError {
    /// True for errors where the propagation policy (§7) says the caller
    /// should move the affected title to `review` rather than `failed` —
    /// the user could plausibly recover by selecting manually.
    pub fn is_recoverable_by_review(&self) -> bool {
        matches!(
            self,
            IngestError::TimeoutError(_) | IngestError::NetworkError(_)
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, IngestError>;
