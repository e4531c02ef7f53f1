use crate::store::error::StoreError;
use crate::store::models::{
    BasalDelivery, CgmReading, Event, EventType, ExtractOutcome, ExtractTarget, ExtractionSkip,
    NewBasalDelivery, NewCgmReading, NewEvent, NewRawEvent, RawBatchOutcome, RawEvent,
    StoreStats, Watermark,
};
use crate::store::store::PipelineStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct FakeState {
    raw_events: Vec<RawEvent>,
    conflicts: Vec<NewRawEvent>,
    events: Vec<Event>,
    cgm_readings: Vec<CgmReading>,
    basal_deliveries: Vec<BasalDelivery>,
    skips: Vec<ExtractionSkip>,
    watermarks: HashMap<String, Watermark>,
    next_id: i64,
    fail_next_commit: Option<String>,
    unavailable: bool,
}

impl FakeState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("fake store unavailable".to_string()));
        }
        Ok(())
    }

    fn take_commit_failure(&mut self) -> Result<(), StoreError> {
        match self.fail_next_commit.take() {
            Some(message) => Err(StoreError::OperationError(message)),
            None => Ok(()),
        }
    }

    fn has_derived(&self, target: ExtractTarget, event_id: i64) -> bool {
        match target {
            ExtractTarget::CgmReadings => self.cgm_readings.iter().any(|r| r.event_id == event_id),
            ExtractTarget::BasalDeliveries => {
                self.basal_deliveries.iter().any(|d| d.event_id == event_id)
            }
        }
    }

    fn record_skips(&mut self, skips: Vec<ExtractionSkip>) -> usize {
        let mut inserted = 0;
        for skip in skips {
            let exists = self
                .skips
                .iter()
                .any(|s| s.event_id == skip.event_id && s.target == skip.target);
            if !exists {
                self.skips.push(skip);
                inserted += 1;
            }
        }
        inserted
    }
}

/// A fake in-memory implementation of the PipelineStore trait for testing
#[derive(Clone, Default)]
pub struct FakeStore {
    state: Arc<RwLock<FakeState>>,
}

impl FakeStore {
    /// Create a new empty FakeStore
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit_*` call fail without applying any of its rows
    pub fn fake_fail_next_commit(&self, message: &str) {
        self.state.write().unwrap().fail_next_commit = Some(message.to_string());
    }

    /// Make every operation report the store as unreachable
    pub fn fake_set_unavailable(&self, unavailable: bool) {
        self.state.write().unwrap().unavailable = unavailable;
    }
}

#[async_trait]
impl PipelineStore for FakeStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.state.read().unwrap().check_available()
    }

    async fn get_watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        Ok(state
            .watermarks
            .get(stream)
            .map(|w| w.last_event_created_at))
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        let mut watermarks: Vec<Watermark> = state.watermarks.values().cloned().collect();
        watermarks.sort_by(|a, b| a.stream_name.cmp(&b.stream_name));
        Ok(watermarks)
    }

    async fn commit_raw_batch(
        &self,
        stream: &str,
        records: Vec<NewRawEvent>,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<RawBatchOutcome, StoreError> {
        let mut state = self.state.write().unwrap();
        state.check_available()?;
        state.take_commit_failure()?;

        let current = state.watermarks.get(stream).map(|w| w.last_event_created_at);
        if let (Some(current), Some(attempted)) = (current, watermark) {
            if attempted < current {
                return Err(StoreError::WatermarkRegression {
                    stream: stream.to_string(),
                    current,
                    attempted,
                });
            }
        }

        let mut outcome = RawBatchOutcome::default();
        for record in records {
            let existing = state
                .raw_events
                .iter()
                .find(|r| r.external_id == record.external_id)
                .map(|r| r.raw_payload.clone());
            match existing {
                None => {
                    let id = state.next_id();
                    state.raw_events.push(RawEvent {
                        id,
                        stream: record.stream,
                        external_id: record.external_id,
                        event_created_at: record.event_created_at,
                        fetched_at: record.fetched_at,
                        raw_payload: record.raw_payload,
                    });
                    outcome.inserted += 1;
                }
                Some(payload) if payload == record.raw_payload => outcome.duplicates += 1,
                Some(_) => {
                    state.conflicts.push(record);
                    outcome.conflicts += 1;
                }
            }
        }

        outcome.watermark = match (current, watermark) {
            (Some(current), Some(new)) if new <= current => Some(current),
            (_, Some(new)) => {
                state.watermarks.insert(
                    stream.to_string(),
                    Watermark {
                        stream_name: stream.to_string(),
                        last_event_created_at: new,
                        updated_at: Utc::now(),
                    },
                );
                Some(new)
            }
            (current, None) => current,
        };

        Ok(outcome)
    }

    async fn get_raw_events_without_event(
        &self,
        limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        Ok(state
            .raw_events
            .iter()
            .filter(|raw| !state.events.iter().any(|e| e.raw_event_id == raw.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_raw_event(&self, id: i64) -> Result<Option<RawEvent>, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        Ok(state.raw_events.iter().find(|r| r.id == id).cloned())
    }

    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<usize, StoreError> {
        let mut state = self.state.write().unwrap();
        state.check_available()?;
        state.take_commit_failure()?;

        if let Some(missing) = events
            .iter()
            .find(|e| !state.raw_events.iter().any(|r| r.id == e.raw_event_id))
        {
            return Err(StoreError::OperationError(format!(
                "raw event {} does not exist",
                missing.raw_event_id
            )));
        }

        let parsed_at = Utc::now();
        let mut inserted = 0;
        for event in events {
            if state.events.iter().any(|e| e.raw_event_id == event.raw_event_id) {
                continue;
            }
            let id = state.next_id();
            state.events.push(Event {
                id,
                raw_event_id: event.raw_event_id,
                event_type: event.event_type,
                vendor_type_id: event.vendor_type_id,
                event_name: event.event_name,
                occurred_at: event.occurred_at,
                structured_fields: event.structured_fields,
                parsed_at,
            });
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_unparsed_events(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.event_type == EventType::Unparsed && e.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replace_unparsed_event(
        &self,
        event_id: i64,
        event: NewEvent,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().unwrap();
        state.check_available()?;

        let existing = state
            .events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or(StoreError::EventNotFound(event_id))?;
        if existing.event_type != EventType::Unparsed || existing.raw_event_id != event.raw_event_id
        {
            return Ok(false);
        }

        existing.event_type = event.event_type;
        existing.vendor_type_id = event.vendor_type_id;
        existing.event_name = event.event_name;
        existing.occurred_at = event.occurred_at;
        existing.structured_fields = event.structured_fields;
        existing.parsed_at = Utc::now();
        Ok(true)
    }

    async fn get_events_pending_extraction(
        &self,
        target: ExtractTarget,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        let source_type = target.source_event_type();
        Ok(state
            .events
            .iter()
            .filter(|e| e.event_type == source_type)
            .filter(|e| !state.has_derived(target, e.id))
            .filter(|e| {
                !state
                    .skips
                    .iter()
                    .any(|s| s.event_id == e.id && s.target == target)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn commit_cgm_readings(
        &self,
        readings: Vec<NewCgmReading>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError> {
        let mut state = self.state.write().unwrap();
        state.check_available()?;
        state.take_commit_failure()?;

        let mut outcome = ExtractOutcome::default();
        for reading in readings {
            if state.has_derived(ExtractTarget::CgmReadings, reading.event_id) {
                continue;
            }
            let id = state.next_id();
            state.cgm_readings.push(CgmReading {
                id,
                event_id: reading.event_id,
                value: reading.value,
                unit: reading.unit,
                occurred_at: reading.occurred_at,
            });
            outcome.inserted += 1;
        }
        outcome.skipped = state.record_skips(skips);
        Ok(outcome)
    }

    async fn commit_basal_deliveries(
        &self,
        deliveries: Vec<NewBasalDelivery>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError> {
        let mut state = self.state.write().unwrap();
        state.check_available()?;
        state.take_commit_failure()?;

        let mut outcome = ExtractOutcome::default();
        for delivery in deliveries {
            if state.has_derived(ExtractTarget::BasalDeliveries, delivery.event_id) {
                continue;
            }
            let id = state.next_id();
            state.basal_deliveries.push(BasalDelivery {
                id,
                event_id: delivery.event_id,
                rate: delivery.rate,
                profile_rate: delivery.profile_rate,
                algorithm_rate: delivery.algorithm_rate,
                temp_rate: delivery.temp_rate,
                duration_minutes: delivery.duration_minutes,
                occurred_at: delivery.occurred_at,
            });
            outcome.inserted += 1;
        }
        outcome.skipped = state.record_skips(skips);
        Ok(outcome)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.read().unwrap();
        state.check_available()?;
        Ok(StoreStats {
            raw_events: state.raw_events.len() as u64,
            events: state.events.len() as u64,
            unparsed_events: state
                .events
                .iter()
                .filter(|e| e.event_type == EventType::Unparsed)
                .count() as u64,
            cgm_readings: state.cgm_readings.len() as u64,
            basal_deliveries: state.basal_deliveries.len() as u64,
            extraction_skips: state.skips.len() as u64,
            raw_event_conflicts: state.conflicts.len() as u64,
        })
    }

    async fn list_raw_events(&self, stream: &str) -> Result<Vec<RawEvent>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .raw_events
            .iter()
            .filter(|r| r.stream == stream)
            .cloned()
            .collect())
    }

    async fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self.state.read().unwrap().events.clone())
    }

    async fn list_cgm_readings(&self) -> Result<Vec<CgmReading>, StoreError> {
        Ok(self.state.read().unwrap().cgm_readings.clone())
    }

    async fn list_basal_deliveries(&self) -> Result<Vec<BasalDelivery>, StoreError> {
        Ok(self.state.read().unwrap().basal_deliveries.clone())
    }

    async fn list_extraction_skips(
        &self,
        target: ExtractTarget,
    ) -> Result<Vec<ExtractionSkip>, StoreError> {
        let state = self.state.read().unwrap();
        Ok(state
            .skips
            .iter()
            .filter(|s| s.target == target)
            .cloned()
            .collect())
    }
}
