use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when interacting with the pipeline store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    OpenError(String),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation failed: {0}")]
    OperationError(String),

    #[error("Watermark for stream {stream} would regress from {current} to {attempted}")]
    WatermarkRegression {
        stream: String,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("Event {0} not found")]
    EventNotFound(i64),

    #[error("Store is locked")]
    Locked,
}

impl StoreError {
    /// True when the store cannot recover by retrying the same operation later
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::OpenError(_) | StoreError::Unavailable(_))
    }

    /// True when the error reports an attempted violation of a data invariant
    pub fn is_consistency(&self) -> bool {
        matches!(self, StoreError::WatermarkRegression { .. })
    }
}
