//! Error types for payload encoding

/// Result type alias for payload operations
pub type PayloadResult<T> = Result<T, PayloadError>;

/// Errors that can occur while encoding a container for the collector
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    /// JSON encoding failed
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
