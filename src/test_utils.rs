use crate::api::ApiRecord;
use crate::store::{NewRawEvent, RawEvent};
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

pub const TEST_STREAM: &str = "pump_events";

/// Fixed reference time so assertions on timestamps are exact
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

/// `base_time()` plus the given number of minutes
pub fn at_minute(minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(minutes)
}

/// Build a vendor payload with the standard envelope
pub fn payload(vendor_code: i64, occurred_at: DateTime<Utc>, fields: Value) -> Value {
    let mut object = json!({
        "event_id": vendor_code,
        "event_timestamp": occurred_at.to_rfc3339(),
        "seq_num": 1000 + vendor_code,
    });
    if let (Some(object), Value::Object(fields)) = (object.as_object_mut(), fields) {
        object.extend(fields);
    }
    object
}

pub fn cgm_payload(occurred_at: DateTime<Utc>, value: i64) -> Value {
    payload(
        399,
        occurred_at,
        json!({ "currentglucosedisplayvalue": value, "egvTimestamp": 1234 }),
    )
}

pub fn basal_payload(
    occurred_at: DateTime<Utc>,
    profile: Option<i64>,
    algorithm: Option<i64>,
    temp: Option<i64>,
) -> Value {
    payload(
        279,
        occurred_at,
        json!({
            "profileBasalRate": profile,
            "algorithmRate": algorithm,
            "tempRate": temp,
        }),
    )
}

pub fn bolus_payload(occurred_at: DateTime<Utc>) -> Value {
    payload(
        280,
        occurred_at,
        json!({ "bolusid": 7, "insulindelivered": 1500 }),
    )
}

/// Wrap a payload as it comes back from the API
pub fn api_record(external_id: &str, created_at: DateTime<Utc>, payload: &Value) -> ApiRecord {
    ApiRecord {
        external_id: external_id.to_string(),
        event_created_at: created_at,
        payload: Bytes::from(serde_json::to_vec(payload).unwrap()),
    }
}

pub fn cgm_record(external_id: &str, created_at: DateTime<Utc>, value: i64) -> ApiRecord {
    api_record(external_id, created_at, &cgm_payload(created_at, value))
}

pub fn basal_record(
    external_id: &str,
    created_at: DateTime<Utc>,
    profile: Option<i64>,
    algorithm: Option<i64>,
    temp: Option<i64>,
) -> ApiRecord {
    api_record(
        external_id,
        created_at,
        &basal_payload(created_at, profile, algorithm, temp),
    )
}

pub fn new_raw_event(external_id: &str, created_at: DateTime<Utc>, payload: &[u8]) -> NewRawEvent {
    NewRawEvent {
        stream: TEST_STREAM.to_string(),
        external_id: external_id.to_string(),
        event_created_at: created_at,
        fetched_at: created_at + Duration::seconds(30),
        raw_payload: Bytes::copy_from_slice(payload),
    }
}

/// A stored raw event, for exercising the parser without a store
pub fn raw_event(id: i64, created_at: DateTime<Utc>, payload: &[u8]) -> RawEvent {
    RawEvent {
        id,
        stream: TEST_STREAM.to_string(),
        external_id: format!("ext-{id}"),
        event_created_at: created_at,
        fetched_at: created_at + Duration::seconds(30),
        raw_payload: Bytes::copy_from_slice(payload),
    }
}
