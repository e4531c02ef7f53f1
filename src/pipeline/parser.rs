use crate::pipeline::error::{PipelineError, Stage};
use crate::store::{EventType, NewEvent, PipelineStore, RawEvent};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Name given to events the parser cannot classify
pub const UNPARSED_EVENT_NAME: &str = "UNPARSED";

/// Payload keys consumed by the envelope, not copied into structured fields
const ENVELOPE_KEYS: [&str; 3] = ["event_id", "event_timestamp", "raw_event"];

/// Vendor event codes the parser recognises
const VENDOR_EVENTS: &[(i64, &str, EventType)] = &[
    (256, "LID_CGM_DATA_GXB", EventType::CgmReading),
    (279, "LID_BASAL_DELIVERY", EventType::BasalDelivery),
    (280, "LID_BOLUS_DELIVERY", EventType::BolusDelivery),
    (372, "LID_CGM_DATA_FSL2", EventType::CgmReading),
    (399, "LID_CGM_DATA_G7", EventType::CgmReading),
];

fn lookup_vendor_event(code: i64) -> Option<(&'static str, EventType)> {
    VENDOR_EVENTS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, event_type)| (*name, *event_type))
}

fn unparsed(
    raw: &RawEvent,
    vendor_type_id: Option<i64>,
    occurred_at: Option<DateTime<Utc>>,
    reason: String,
    payload: Option<Value>,
) -> NewEvent {
    let mut fields = Map::new();
    fields.insert("reason".to_string(), json!(reason));
    if let Some(payload) = payload {
        fields.insert("payload".to_string(), payload);
    }
    NewEvent {
        raw_event_id: raw.id,
        event_type: EventType::Unparsed,
        vendor_type_id,
        event_name: UNPARSED_EVENT_NAME.to_string(),
        occurred_at: occurred_at.unwrap_or(raw.event_created_at),
        structured_fields: fields,
    }
}

fn vendor_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Accepts RFC 3339, or a naive timestamp taken as UTC
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

/// Classify one raw event. Pure: the same payload always yields the same event.
///
/// Shapes the parser does not understand become `Unparsed` with the reason
/// recorded, so nothing is dropped.
pub fn parse_raw_event(raw: &RawEvent) -> NewEvent {
    let value: Value = match serde_json::from_slice(&raw.raw_payload) {
        Ok(value) => value,
        Err(e) => return unparsed(raw, None, None, format!("invalid JSON: {e}"), None),
    };

    let mut object = match value {
        Value::Object(object) => object,
        other => {
            return unparsed(
                raw,
                None,
                None,
                "payload is not a JSON object".to_string(),
                Some(other),
            )
        }
    };

    let code = object.get("event_id").and_then(vendor_code);
    let occurred_at = object.get("event_timestamp").and_then(parse_timestamp);

    let Some(code) = code else {
        return unparsed(
            raw,
            None,
            occurred_at,
            "missing or invalid event_id".to_string(),
            Some(Value::Object(object)),
        );
    };
    let Some(occurred_at) = occurred_at else {
        return unparsed(
            raw,
            Some(code),
            None,
            "missing or invalid event_timestamp".to_string(),
            Some(Value::Object(object)),
        );
    };
    let Some((event_name, event_type)) = lookup_vendor_event(code) else {
        return unparsed(
            raw,
            Some(code),
            Some(occurred_at),
            format!("unknown vendor event code {code}"),
            Some(Value::Object(object)),
        );
    };

    for key in ENVELOPE_KEYS {
        object.remove(key);
    }

    NewEvent {
        raw_event_id: raw.id,
        event_type,
        vendor_type_id: Some(code),
        event_name: event_name.to_string(),
        occurred_at,
        structured_fields: object,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub batches: usize,
    pub inserted: usize,
    pub unparsed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReparseReport {
    pub examined: usize,
    pub reclassified: usize,
    pub cancelled: bool,
}

/// Turns raw events without an event into events, one batch per transaction
pub struct Parser<S: PipelineStore> {
    store: Arc<S>,
    batch_size: usize,
}

impl<S: PipelineStore> Parser<S> {
    pub fn new(store: Arc<S>, batch_size: usize) -> Self {
        Parser {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Parse every raw event that has no event yet, oldest first. Cancellation
    /// is honoured between batches.
    pub async fn parse_pending(
        &self,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ParseReport, PipelineError> {
        let mut report = ParseReport::default();

        loop {
            if *cancel.borrow() {
                report.cancelled = true;
                break;
            }

            let raws = self
                .store
                .get_raw_events_without_event(self.batch_size)
                .await
                .map_err(|e| PipelineError::store(Stage::Parse, None, e))?;
            if raws.is_empty() {
                break;
            }

            let events: Vec<NewEvent> = raws.iter().map(parse_raw_event).collect();
            let unparsed = events
                .iter()
                .filter(|e| e.event_type == EventType::Unparsed)
                .count();
            for event in events.iter().filter(|e| e.event_type == EventType::Unparsed) {
                let reason = event
                    .structured_fields
                    .get("reason")
                    .and_then(|reason| reason.as_str())
                    .unwrap_or_default();
                debug!("Raw event {} is unparsed: {reason}", event.raw_event_id);
            }

            let inserted = self
                .store
                .insert_events(events)
                .await
                .map_err(|e| PipelineError::store(Stage::Parse, None, e))?;
            report.batches += 1;
            report.inserted += inserted;
            report.unparsed += unparsed;
            debug!("Parsed batch of {} raw event(s), inserted {inserted}", raws.len());

            // Nothing new was written, so the same rows would come back again
            if inserted == 0 || raws.len() < self.batch_size {
                break;
            }
        }

        if report.unparsed > 0 {
            warn!("{} raw event(s) could not be classified", report.unparsed);
        }
        info!(
            "Parse stage complete: inserted={}, unparsed={}, batches={}",
            report.inserted, report.unparsed, report.batches
        );
        Ok(report)
    }

    /// Re-run the parser over `Unparsed` events and replace those it now
    /// recognises
    pub async fn reparse_unrecognized(
        &self,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReparseReport, PipelineError> {
        let mut report = ReparseReport::default();
        let mut after_id = 0;

        loop {
            if *cancel.borrow() {
                report.cancelled = true;
                break;
            }

            let events = self
                .store
                .get_unparsed_events(after_id, self.batch_size)
                .await
                .map_err(|e| PipelineError::store(Stage::Parse, None, e))?;
            let Some(last) = events.last() else {
                break;
            };
            after_id = last.id;

            for event in &events {
                report.examined += 1;
                let raw = self
                    .store
                    .get_raw_event(event.raw_event_id)
                    .await
                    .map_err(|e| PipelineError::store(Stage::Parse, None, e))?;
                let Some(raw) = raw else {
                    warn!(
                        "Event {} references missing raw event {}",
                        event.id, event.raw_event_id
                    );
                    continue;
                };

                let reparsed = parse_raw_event(&raw);
                if reparsed.event_type == EventType::Unparsed {
                    continue;
                }
                let replaced = self
                    .store
                    .replace_unparsed_event(event.id, reparsed)
                    .await
                    .map_err(|e| PipelineError::store(Stage::Parse, None, e))?;
                if replaced {
                    report.reclassified += 1;
                }
            }
        }

        info!(
            "Reparse complete: examined={}, reclassified={}",
            report.examined, report.reclassified
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FakeStore;
    use crate::test_utils::{
        at_minute, basal_payload, cgm_payload, new_raw_event, payload, raw_event, TEST_STREAM,
    };

    fn raw_from(value: &Value) -> RawEvent {
        raw_event(1, at_minute(0), &serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn cgm_payload_is_classified_and_envelope_removed() {
        let mut value = cgm_payload(at_minute(5), 123);
        value["raw_event"] = json!("00ff00");

        let event = parse_raw_event(&raw_from(&value));

        assert_eq!(event.event_type, EventType::CgmReading);
        assert_eq!(event.event_name, "LID_CGM_DATA_G7");
        assert_eq!(event.vendor_type_id, Some(399));
        assert_eq!(event.occurred_at, at_minute(5));
        assert_eq!(
            event.structured_fields.get("currentglucosedisplayvalue"),
            Some(&json!(123))
        );
        assert!(!event.structured_fields.contains_key("event_id"));
        assert!(!event.structured_fields.contains_key("raw_event"));
        assert!(event.structured_fields.contains_key("seq_num"));
    }

    #[test]
    fn every_cgm_code_maps_to_cgm_reading() {
        for code in [256, 372, 399] {
            let value = payload(code, at_minute(1), json!({ "currentglucosedisplayvalue": 100 }));
            assert_eq!(
                parse_raw_event(&raw_from(&value)).event_type,
                EventType::CgmReading
            );
        }
    }

    #[test]
    fn basal_payload_is_classified() {
        let value = basal_payload(at_minute(2), Some(800), None, None);
        let event = parse_raw_event(&raw_from(&value));
        assert_eq!(event.event_type, EventType::BasalDelivery);
        assert_eq!(event.event_name, "LID_BASAL_DELIVERY");
    }

    #[test]
    fn string_code_and_naive_timestamp_are_accepted() {
        let value = json!({
            "event_id": "280",
            "event_timestamp": "2024-03-01 00:07:00",
            "insulindelivered": 1200,
        });
        let event = parse_raw_event(&raw_from(&value));
        assert_eq!(event.event_type, EventType::BolusDelivery);
        assert_eq!(event.occurred_at, at_minute(7));
    }

    #[test]
    fn unknown_code_is_unparsed_with_reason() {
        let value = payload(9999, at_minute(3), json!({ "foo": 1 }));
        let event = parse_raw_event(&raw_from(&value));
        assert_eq!(event.event_type, EventType::Unparsed);
        assert_eq!(event.event_name, UNPARSED_EVENT_NAME);
        assert_eq!(event.vendor_type_id, Some(9999));
        assert_eq!(event.occurred_at, at_minute(3));
        assert_eq!(
            event.structured_fields.get("reason"),
            Some(&json!("unknown vendor event code 9999"))
        );
        assert!(event.structured_fields.contains_key("payload"));
    }

    #[test]
    fn invalid_json_falls_back_to_raw_timestamp() {
        let raw = raw_event(4, at_minute(11), b"{not json");
        let event = parse_raw_event(&raw);
        assert_eq!(event.event_type, EventType::Unparsed);
        assert_eq!(event.raw_event_id, 4);
        assert_eq!(event.occurred_at, at_minute(11));
        assert!(event.structured_fields["reason"]
            .as_str()
            .unwrap()
            .starts_with("invalid JSON"));
    }

    #[test]
    fn missing_envelope_fields_are_unparsed() {
        let no_code = json!({ "event_timestamp": "2024-03-01T00:01:00Z" });
        let no_time = json!({ "event_id": 399 });
        let not_object = json!([1, 2, 3]);

        let no_code = parse_raw_event(&raw_from(&no_code));
        let no_time = parse_raw_event(&raw_from(&no_time));
        let not_object = parse_raw_event(&raw_from(&not_object));

        assert_eq!(no_code.event_type, EventType::Unparsed);
        assert_eq!(no_code.occurred_at, at_minute(1));
        assert_eq!(no_time.event_type, EventType::Unparsed);
        assert_eq!(no_time.vendor_type_id, Some(399));
        assert_eq!(not_object.event_type, EventType::Unparsed);
    }

    #[test]
    fn parsing_is_deterministic() {
        let raw = raw_from(&cgm_payload(at_minute(5), 140));
        assert_eq!(parse_raw_event(&raw), parse_raw_event(&raw));
    }

    #[tokio::test]
    async fn parse_pending_stores_unrecognised_payloads_in_batches() {
        let store = Arc::new(FakeStore::new());
        let bodies = [
            serde_json::to_vec(&cgm_payload(at_minute(1), 101)).unwrap(),
            serde_json::to_vec(&payload(9999, at_minute(2), json!({ "foo": 1 }))).unwrap(),
            b"{not json".to_vec(),
        ];
        let records = bodies
            .iter()
            .enumerate()
            .map(|(i, body)| new_raw_event(&format!("r{i}"), at_minute(i as i64 + 1), body))
            .collect();
        store
            .commit_raw_batch(TEST_STREAM, records, Some(at_minute(3)))
            .await
            .unwrap();
        let parser = Parser::new(Arc::clone(&store), 2);
        let (_cancel_tx, cancel) = watch::channel(false);

        let report = parser.parse_pending(&cancel).await.unwrap();

        assert_eq!(report.inserted, 3);
        assert_eq!(report.unparsed, 2);
        assert_eq!(report.batches, 2);
        let events = store.list_events().await.unwrap();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![EventType::CgmReading, EventType::Unparsed, EventType::Unparsed]
        );

        let again = parser.parse_pending(&cancel).await.unwrap();
        assert_eq!(again.inserted, 0);
    }
}
