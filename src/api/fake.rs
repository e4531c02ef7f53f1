use crate::api::error::ApiError;
use crate::api::source::{ApiRecord, EventSource, Page};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory event source for testing
///
/// Serves records created strictly after `since`, ordered by creation time,
/// in pages of `page_size`. Page tokens are plain offsets.
#[derive(Clone)]
pub struct FakeEventSource {
    records: Arc<Mutex<HashMap<String, Vec<ApiRecord>>>>,
    page_size: Arc<Mutex<usize>>,
    /// 1-based page number that fails, and the error it fails with
    failure: Arc<Mutex<Option<(usize, ApiError)>>>,
    delay: Arc<Mutex<Option<Duration>>>,
    requested_since: Arc<Mutex<Vec<Option<DateTime<Utc>>>>>,
    fetch_calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeEventSource {
    pub fn new() -> Self {
        FakeEventSource {
            records: Arc::new(Mutex::new(HashMap::new())),
            page_size: Arc::new(Mutex::new(100)),
            failure: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(None)),
            requested_since: Arc::new(Mutex::new(Vec::new())),
            fetch_calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make records visible on a stream
    pub fn fake_add_records(&self, stream: &str, records: Vec<ApiRecord>) {
        let mut all = self.records.lock().unwrap();
        let entry = all.entry(stream.to_string()).or_default();
        entry.extend(records);
        entry.sort_by_key(|r| r.event_created_at);
    }

    /// Replace the payload served for an external id, simulating a vendor edit
    pub fn fake_replace_payload(&self, stream: &str, external_id: &str, payload: &[u8]) {
        let mut all = self.records.lock().unwrap();
        if let Some(record) = all
            .get_mut(stream)
            .and_then(|records| records.iter_mut().find(|r| r.external_id == external_id))
        {
            record.payload = bytes::Bytes::copy_from_slice(payload);
        }
    }

    pub fn fake_set_page_size(&self, page_size: usize) {
        *self.page_size.lock().unwrap() = page_size.max(1);
    }

    /// Fail every request for the given 1-based page number
    pub fn fake_fail_on_page(&self, page: usize, error: ApiError) {
        *self.failure.lock().unwrap() = Some((page, error));
    }

    pub fn fake_clear_failure(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Delay every fetch, for overlap and timeout tests
    pub fn fake_set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running fetches observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `since` of every request, in call order
    pub fn requested_since(&self) -> Vec<Option<DateTime<Utc>>> {
        self.requested_since.lock().unwrap().clone()
    }

    fn page(
        &self,
        stream: &str,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<Page, ApiError> {
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ApiError::Decode(format!("bad page token {token}")))?,
            None => 0,
        };
        let page_size = *self.page_size.lock().unwrap();

        if let Some((page, error)) = self.failure.lock().unwrap().as_ref() {
            if offset / page_size + 1 == *page {
                return Err(error.clone());
            }
        }

        let all = self.records.lock().unwrap();
        let visible: Vec<&ApiRecord> = all
            .get(stream)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| since.map_or(true, |s| r.event_created_at > s))
                    .collect()
            })
            .unwrap_or_default();

        let records: Vec<ApiRecord> = visible
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|r| (*r).clone())
            .collect();
        let next = offset + records.len();
        let next_page_token = (next < visible.len()).then(|| next.to_string());

        Ok(Page {
            records,
            next_page_token,
        })
    }
}

#[async_trait]
impl EventSource for FakeEventSource {
    async fn fetch_events(
        &self,
        stream: &str,
        since: Option<DateTime<Utc>>,
        page_token: Option<&str>,
    ) -> Result<Page, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.requested_since.lock().unwrap().push(since);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        // Decrements even when the caller drops this future on timeout
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.page(stream, since, page_token)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
