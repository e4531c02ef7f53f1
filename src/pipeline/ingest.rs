use crate::api::{ApiError, ApiRecord, EventSource};
use crate::pipeline::error::{PipelineError, Stage};
use crate::store::{NewRawEvent, PipelineStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one ingest run for a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub conflicts: usize,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
}

/// Fetches new raw events for a stream and commits them with the watermark
pub struct Ingestor<A: EventSource, S: PipelineStore> {
    source: Arc<A>,
    store: Arc<S>,
    request_timeout: Duration,
    lookback: chrono::Duration,
}

impl<A: EventSource, S: PipelineStore> Ingestor<A, S> {
    pub fn new(
        source: Arc<A>,
        store: Arc<S>,
        request_timeout: Duration,
        lookback: chrono::Duration,
    ) -> Self {
        Ingestor {
            source,
            store,
            request_timeout,
            lookback,
        }
    }

    /// Fetch every page after the stream's watermark, then write all records
    /// and the advanced watermark in one commit. A failure anywhere leaves
    /// the store untouched.
    pub async fn ingest(&self, stream: &str) -> Result<IngestReport, PipelineError> {
        let watermark_before = self
            .store
            .get_watermark(stream)
            .await
            .map_err(|e| PipelineError::store(Stage::Ingest, Some(stream), e))?;
        let since = watermark_before
            .map(|w| {
                w.checked_sub_signed(self.lookback).ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "lookback of {} minutes before {w} is out of range",
                        self.lookback.num_minutes()
                    ))
                })
            })
            .transpose()?;

        match since {
            Some(ts) => info!("Ingesting stream {stream} since {ts}"),
            None => info!("No watermark for stream {stream}, fetching full history"),
        }

        let (records, pages) = self.fetch_all(stream, since).await?;
        let fetched = records.len();

        let batch_max = records.iter().map(|r| r.event_created_at).max();
        let new_watermark = match (batch_max, watermark_before) {
            (Some(max), Some(current)) if max <= current => None,
            (max, _) => max,
        };

        let fetched_at = Utc::now();
        let batch: Vec<NewRawEvent> = records
            .into_iter()
            .map(|record| NewRawEvent {
                stream: stream.to_string(),
                external_id: record.external_id,
                event_created_at: record.event_created_at,
                fetched_at,
                raw_payload: record.payload,
            })
            .collect();

        let outcome = self
            .store
            .commit_raw_batch(stream, batch, new_watermark)
            .await
            .map_err(|e| PipelineError::store(Stage::Ingest, Some(stream), e))?;

        if outcome.conflicts > 0 {
            warn!(
                "Stream {stream}: {} re-fetched record(s) differ from the stored payload",
                outcome.conflicts
            );
        }

        let report = IngestReport {
            pages,
            fetched,
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            conflicts: outcome.conflicts,
            watermark_before,
            watermark_after: outcome.watermark,
        };
        info!(
            "Ingested stream {stream}: pages={}, fetched={}, inserted={}, duplicates={}, watermark={:?}",
            report.pages, report.fetched, report.inserted, report.duplicates, report.watermark_after
        );
        Ok(report)
    }

    async fn fetch_all(
        &self,
        stream: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<ApiRecord>, usize), PipelineError> {
        let mut records = Vec::new();
        let mut pages = 0;
        let mut page_token: Option<String> = None;

        loop {
            let fetch = self
                .source
                .fetch_events(stream, since, page_token.as_deref());
            let result = match tokio::time::timeout(self.request_timeout, fetch).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout(self.request_timeout.as_secs())),
            };

            let page = result.map_err(|source| {
                warn!("Fetch of stream {stream} failed on page {}: {source}", pages + 1);
                PipelineError::Fetch {
                    stream: stream.to_string(),
                    since,
                    pages_fetched: pages,
                    source,
                }
            })?;
            pages += 1;
            debug!(
                "Stream {stream} page {pages}: {} record(s)",
                page.records.len()
            );
            records.extend(page.records);

            match page.next_page_token {
                Some(next) if page_token.as_deref() == Some(next.as_str()) => {
                    return Err(PipelineError::Fetch {
                        stream: stream.to_string(),
                        since,
                        pages_fetched: pages,
                        source: ApiError::Decode(format!("page token {next} repeated")),
                    });
                }
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok((records, pages))
    }
}
