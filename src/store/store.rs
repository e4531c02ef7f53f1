use crate::store::error::StoreError;
#[cfg(test)]
use crate::store::models::{BasalDelivery, CgmReading};
use crate::store::models::{
    Event, ExtractOutcome, ExtractTarget, ExtractionSkip, NewBasalDelivery, NewCgmReading,
    NewEvent, NewRawEvent, RawBatchOutcome, RawEvent, StoreStats, Watermark,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// PipelineStore defines the durable state of the pipeline: raw events, parsed
/// events, derived tables and per-stream watermarks.
///
/// Every `commit_*` method is a single transaction. Either all of its rows (and
/// the watermark, where one is passed) become visible, or none do.
#[async_trait]
pub trait PipelineStore: Send + Sync + 'static {
    /// Verify the backing store is still reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Get the watermark for a stream; `None` means nothing was ingested yet
    async fn get_watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// List all stream watermarks ordered by stream name
    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError>;

    /// Insert a fetched batch and advance the stream watermark atomically
    ///
    /// * `records` - inserted by `external_id`; an existing id is skipped, and
    ///   recorded as a conflict when its payload differs
    /// * `watermark` - new watermark; older than the stored one fails with
    ///   `WatermarkRegression`, equal is a no-op, `None` leaves it untouched
    async fn commit_raw_batch(
        &self,
        stream: &str,
        records: Vec<NewRawEvent>,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<RawBatchOutcome, StoreError>;

    /// Get raw events that have no parsed event yet, oldest id first
    async fn get_raw_events_without_event(&self, limit: usize)
        -> Result<Vec<RawEvent>, StoreError>;

    /// Get a single raw event by local id
    async fn get_raw_event(&self, id: i64) -> Result<Option<RawEvent>, StoreError>;

    /// Insert parsed events, skipping any whose raw event already has one.
    /// Returns the number of inserted rows.
    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<usize, StoreError>;

    /// Get `Unparsed` events with an id greater than `after_id`, oldest first
    async fn get_unparsed_events(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    /// Replace an `Unparsed` event with a newly recognised classification.
    /// Returns false if the event is no longer `Unparsed`.
    async fn replace_unparsed_event(
        &self,
        event_id: i64,
        event: NewEvent,
    ) -> Result<bool, StoreError>;

    /// Get events of the target's source type with neither a derived row nor a
    /// recorded skip for that target, oldest id first
    async fn get_events_pending_extraction(
        &self,
        target: ExtractTarget,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    async fn commit_cgm_readings(
        &self,
        readings: Vec<NewCgmReading>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError>;

    async fn commit_basal_deliveries(
        &self,
        deliveries: Vec<NewBasalDelivery>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError>;

    /// Row counts of every table
    async fn stats(&self) -> Result<StoreStats, StoreError>;

    /// All raw events of a stream (test-only)
    #[cfg(test)]
    async fn list_raw_events(&self, stream: &str) -> Result<Vec<RawEvent>, StoreError>;

    /// All parsed events (test-only)
    #[cfg(test)]
    async fn list_events(&self) -> Result<Vec<Event>, StoreError>;

    /// All CGM readings (test-only)
    #[cfg(test)]
    async fn list_cgm_readings(&self) -> Result<Vec<CgmReading>, StoreError>;

    /// All basal deliveries (test-only)
    #[cfg(test)]
    async fn list_basal_deliveries(&self) -> Result<Vec<BasalDelivery>, StoreError>;

    /// All skips recorded for a target (test-only)
    #[cfg(test)]
    async fn list_extraction_skips(
        &self,
        target: ExtractTarget,
    ) -> Result<Vec<ExtractionSkip>, StoreError>;
}

/// Implementation of PipelineStore for Arc<T> where T implements PipelineStore
///
/// Lets the pipeline stages share one store instance.
#[async_trait]
impl<T: PipelineStore + ?Sized> PipelineStore for Arc<T> {
    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn get_watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        (**self).get_watermark(stream).await
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        (**self).list_watermarks().await
    }

    async fn commit_raw_batch(
        &self,
        stream: &str,
        records: Vec<NewRawEvent>,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<RawBatchOutcome, StoreError> {
        (**self).commit_raw_batch(stream, records, watermark).await
    }

    async fn get_raw_events_without_event(
        &self,
        limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError> {
        (**self).get_raw_events_without_event(limit).await
    }

    async fn get_raw_event(&self, id: i64) -> Result<Option<RawEvent>, StoreError> {
        (**self).get_raw_event(id).await
    }

    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<usize, StoreError> {
        (**self).insert_events(events).await
    }

    async fn get_unparsed_events(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        (**self).get_unparsed_events(after_id, limit).await
    }

    async fn replace_unparsed_event(
        &self,
        event_id: i64,
        event: NewEvent,
    ) -> Result<bool, StoreError> {
        (**self).replace_unparsed_event(event_id, event).await
    }

    async fn get_events_pending_extraction(
        &self,
        target: ExtractTarget,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        (**self).get_events_pending_extraction(target, limit).await
    }

    async fn commit_cgm_readings(
        &self,
        readings: Vec<NewCgmReading>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError> {
        (**self).commit_cgm_readings(readings, skips).await
    }

    async fn commit_basal_deliveries(
        &self,
        deliveries: Vec<NewBasalDelivery>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError> {
        (**self).commit_basal_deliveries(deliveries, skips).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        (**self).stats().await
    }

    #[cfg(test)]
    async fn list_raw_events(&self, stream: &str) -> Result<Vec<RawEvent>, StoreError> {
        (**self).list_raw_events(stream).await
    }

    #[cfg(test)]
    async fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        (**self).list_events().await
    }

    #[cfg(test)]
    async fn list_cgm_readings(&self) -> Result<Vec<CgmReading>, StoreError> {
        (**self).list_cgm_readings().await
    }

    #[cfg(test)]
    async fn list_basal_deliveries(&self) -> Result<Vec<BasalDelivery>, StoreError> {
        (**self).list_basal_deliveries().await
    }

    #[cfg(test)]
    async fn list_extraction_skips(
        &self,
        target: ExtractTarget,
    ) -> Result<Vec<ExtractionSkip>, StoreError> {
        (**self).list_extraction_skips(target).await
    }
}
