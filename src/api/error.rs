use thiserror::Error;

/// Errors returned by an event source
///
/// Cloneable so fakes can replay a configured failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Credentials were rejected (401/403)
    #[error("Authentication rejected: {0}")]
    Authentication(String),

    #[error("Rate limited by source (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Network error: {0}")]
    Network(String),

    /// A single page request exceeded its time budget
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Source returned {status}: {body}")]
    Server { status: u16, body: String },

    /// Response body could not be understood
    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
