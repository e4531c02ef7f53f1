use crate::pipeline::error::{PipelineError, Stage};
use crate::store::{
    Event, ExtractOutcome, ExtractTarget, ExtractionSkip, NewBasalDelivery, NewCgmReading,
    PipelineStore,
};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Reportable range of the CGM sensors, in mg/dL
pub const MIN_GLUCOSE_MG_DL: i64 = 40;
pub const MAX_GLUCOSE_MG_DL: i64 = 400;
/// Highest basal rate the pump can deliver, in units per hour
pub const MAX_BASAL_UNITS_PER_HOUR: f64 = 15.0;

pub const GLUCOSE_UNIT: &str = "mg/dL";

const GLUCOSE_FIELD: &str = "currentglucosedisplayvalue";

/// Derive a CGM reading, or the reason the event has none
pub fn extract_cgm(event: &Event) -> Result<NewCgmReading, String> {
    let value = match event.structured_fields.get(GLUCOSE_FIELD) {
        None | Some(Value::Null) => return Err(format!("missing {GLUCOSE_FIELD}")),
        Some(value) => value
            .as_i64()
            .ok_or_else(|| format!("{GLUCOSE_FIELD} is not an integer: {value}"))?,
    };

    if !(MIN_GLUCOSE_MG_DL..=MAX_GLUCOSE_MG_DL).contains(&value) {
        return Err(format!(
            "glucose value {value} outside [{MIN_GLUCOSE_MG_DL}, {MAX_GLUCOSE_MG_DL}] {GLUCOSE_UNIT}"
        ));
    }

    Ok(NewCgmReading {
        event_id: event.id,
        value,
        unit: GLUCOSE_UNIT.to_string(),
        occurred_at: event.occurred_at,
    })
}

/// Optional non-negative integer field
fn non_negative(event: &Event, name: &str) -> Result<Option<i64>, String> {
    match event.structured_fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            Some(n) => Err(format!("{name} is negative: {n}")),
            None => Err(format!("{name} is not an integer: {value}")),
        },
    }
}

/// Derive a basal delivery, or the reason the event has none
///
/// Rates are milli-units per hour. The effective rate is the temp rate when
/// one is running, else the algorithm rate, else the profile rate.
pub fn extract_basal(event: &Event) -> Result<NewBasalDelivery, String> {
    let profile_rate = non_negative(event, "profileBasalRate")?;
    let algorithm_rate = non_negative(event, "algorithmRate")?;
    let temp_rate = non_negative(event, "tempRate")?;
    let duration_minutes = non_negative(event, "duration")?;

    let effective = temp_rate
        .or(algorithm_rate)
        .or(profile_rate)
        .ok_or_else(|| "no basal rate present".to_string())?;
    let rate = effective as f64 / 1000.0;
    if rate > MAX_BASAL_UNITS_PER_HOUR {
        return Err(format!(
            "basal rate {rate} U/h exceeds {MAX_BASAL_UNITS_PER_HOUR} U/h"
        ));
    }

    Ok(NewBasalDelivery {
        event_id: event.id,
        rate,
        profile_rate,
        algorithm_rate,
        temp_rate,
        duration_minutes,
        occurred_at: event.occurred_at,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub batches: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Runs one domain extractor over events it has not yet examined
pub struct Extractor<S: PipelineStore> {
    store: Arc<S>,
    batch_size: usize,
}

impl<S: PipelineStore> Extractor<S> {
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        Extractor {
            store,
            batch_size: batch_size.max(1),
        }
    }

    fn stage(target: ExtractTarget) -> Stage {
        match target {
            ExtractTarget::CgmReadings => Stage::ExtractCgm,
            ExtractTarget::BasalDeliveries => Stage::ExtractBasal,
        }
    }

    /// Derive rows for `target` until no pending events remain. Each batch of
    /// rows and skips is one commit; cancellation is checked between batches.
    pub async fn run(
        &self,
        target: ExtractTarget,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ExtractReport, PipelineError> {
        let stage = Self::stage(target);
        let mut report = ExtractReport::default();

        loop {
            if *cancel.borrow() {
                report.cancelled = true;
                break;
            }

            let events = self
                .store
                .get_events_pending_extraction(target, self.batch_size)
                .await
                .map_err(|e| PipelineError::store(stage, None, e))?;
            if events.is_empty() {
                break;
            }

            let outcome = self.commit_batch(target, &events).await?;
            report.batches += 1;
            report.inserted += outcome.inserted;
            report.skipped += outcome.skipped;

            if outcome.inserted + outcome.skipped == 0 || events.len() < self.batch_size {
                break;
            }
        }

        info!(
            "Extracted {target}: inserted={}, skipped={}",
            report.inserted, report.skipped
        );
        Ok(report)
    }

    async fn commit_batch(
        &self,
        target: ExtractTarget,
        events: &[Event],
    ) -> Result<ExtractOutcome, PipelineError> {
        let now = Utc::now();
        let skip = |event: &Event, reason: String| {
            warn!("Skipping event {} for {target}: {reason}", event.id);
            ExtractionSkip {
                event_id: event.id,
                target,
                reason,
                recorded_at: now,
            }
        };

        let result = match target {
            ExtractTarget::CgmReadings => {
                let mut rows = Vec::new();
                let mut skips = Vec::new();
                for event in events {
                    match extract_cgm(event) {
                        Ok(row) => rows.push(row),
                        Err(reason) => skips.push(skip(event, reason)),
                    }
                }
                debug!("Committing {} CGM reading(s), {} skip(s)", rows.len(), skips.len());
                self.store.commit_cgm_readings(rows, skips).await
            }
            ExtractTarget::BasalDeliveries => {
                let mut rows = Vec::new();
                let mut skips = Vec::new();
                for event in events {
                    match extract_basal(event) {
                        Ok(row) => rows.push(row),
                        Err(reason) => skips.push(skip(event, reason)),
                    }
                }
                debug!(
                    "Committing {} basal delivery row(s), {} skip(s)",
                    rows.len(),
                    skips.len()
                );
                self.store.commit_basal_deliveries(rows, skips).await
            }
        };

        result.map_err(|e| PipelineError::store(Self::stage(target), None, e))
    }
}
