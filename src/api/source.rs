use crate::api::error::ApiError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One event record as delivered by the vendor API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRecord {
    pub external_id: String,
    pub event_created_at: DateTime<Utc>,
    /// Opaque payload, stored verbatim
    pub payload: Bytes,
}

/// A page of records plus the token for the next page, if any
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<ApiRecord>,
    pub next_page_token: Option<String>,
}

/// EventSource fetches raw events for a stream from the vendor
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Fetch one page of events created strictly after `since`
    ///
    /// * `since` - `None` requests the full history
    /// * `page_token` - token from the previous page, `None` for the first
    async fn fetch_events(
        &self,
        stream: &str,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<Page, ApiError>;
}

#[async_trait]
impl<T: EventSource + ?Sized> EventSource for Arc<T> {
    async fn fetch_events(
        &self,
        stream: &str,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<Page, ApiError> {
        (**self).fetch_events(stream, since, page_token).await
    }
}
