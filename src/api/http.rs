//! HTTP event source for the vendor's paged event endpoint.

use crate::api::error::ApiError;
use crate::api::source::{ApiRecord, EventSource, Page};
use crate::config::ApiConfig;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("pumpsync/", env!("CARGO_PKG_VERSION"));

#[derive(Deserialize)]
struct WirePage {
    records: Vec<WireRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct WireRecord {
    id: WireId,
    created_at: DateTime<Utc>,
    payload: Value,
}

/// The vendor is inconsistent about numeric vs string ids
#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Text(s) => s,
            WireId::Number(n) => n.to_string(),
        }
    }
}

/// Event source backed by the vendor HTTP API with a static bearer token
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: Url,
    token: String,
    page_size: u32,
    timeout_secs: u64,
}

impl HttpEventSource {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        if config.token.trim().is_empty() {
            return Err(ApiError::Configuration("api.token is empty".to_string()));
        }
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ApiError::Configuration(format!("Invalid api.base_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::Configuration(format!(
                "api.base_url {} cannot carry a path",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        info!("Created HTTP event source for {}", config.base_url);
        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            page_size: config.page_size,
            timeout_secs: config.request_timeout_secs,
        })
    }

    /// The stream name is pushed as a single percent-encoded path segment
    fn events_url(&self, stream: &str) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Configuration(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "v1", "streams", stream, "events"]);
        Ok(url)
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn fetch_events(
        &self,
        stream: &str,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<Page, ApiError> {
        let url = self.events_url(stream)?;
        let mut query: Vec<(&str, String)> = vec![("limit", self.page_size.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Micros, true)));
        }
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }

        debug!(url = %url, ?since, ?page_token, "fetching events");
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout_secs))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after.as_deref(), body));
        }

        let body = resp.bytes().await.map_err(|e| map_reqwest_error(e, self.timeout_secs))?;
        let page = decode_page(&body)?;
        debug!(
            count = page.records.len(),
            has_next = page.next_page_token.is_some(),
            "fetched page"
        );
        Ok(page)
    }
}

/// Map a non-success status to the matching error
pub fn classify_status(status: u16, retry_after: Option<&str>, body: String) -> ApiError {
    match status {
        401 | 403 => ApiError::Authentication(format!("status {status}: {body}")),
        429 => ApiError::RateLimited {
            retry_after_secs: retry_after.and_then(|v| v.trim().parse().ok()),
        },
        _ => ApiError::Server { status, body },
    }
}

/// Decode a JSON page body. Payloads are re-serialised compactly, so the
/// stored bytes are stable across re-fetches of the same record.
pub fn decode_page(body: &[u8]) -> Result<Page, ApiError> {
    let wire: WirePage =
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))?;

    let records = wire
        .records
        .into_iter()
        .map(|record| {
            let payload = serde_json::to_vec(&record.payload)
                .map_err(|e| ApiError::Decode(e.to_string()))?;
            Ok(ApiRecord {
                external_id: record.id.into_string(),
                event_created_at: record.created_at,
                payload: Bytes::from(payload),
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(Page {
        records,
        next_page_token: wire.next_page_token.filter(|t| !t.is_empty()),
    })
}

fn map_reqwest_error(e: reqwest::Error, timeout_secs: u64) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout(timeout_secs)
    } else if e.is_decode() {
        ApiError::Decode(e.to_string())
    } else {
        ApiError::Network(e.to_string())
    }
}
