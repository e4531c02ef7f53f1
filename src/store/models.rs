use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Verbatim vendor record as stored in `raw_events`. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub id: i64,
    pub stream: String,
    /// Vendor-assigned identifier, unique across the table
    pub external_id: String,
    /// Vendor creation timestamp, the basis for watermarking
    pub event_created_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub raw_payload: Bytes,
}

/// A raw record fetched from the vendor, not yet assigned a local id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRawEvent {
    pub stream: String,
    pub external_id: String,
    pub event_created_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub raw_payload: Bytes,
}

/// Classification the parser assigns to a raw payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    CgmReading,
    BasalDelivery,
    BolusDelivery,
    /// Payload shape the parser does not recognise (yet)
    Unparsed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CgmReading => "cgm_reading",
            EventType::BasalDelivery => "basal_delivery",
            EventType::BolusDelivery => "bolus_delivery",
            EventType::Unparsed => "unparsed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cgm_reading" => Ok(EventType::CgmReading),
            "basal_delivery" => Ok(EventType::BasalDelivery),
            "bolus_delivery" => Ok(EventType::BolusDelivery),
            "unparsed" => Ok(EventType::Unparsed),
            other => Err(format!("Invalid event type: {other}")),
        }
    }
}

/// Structured decomposition of one raw event (1:1)
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub raw_event_id: i64,
    pub event_type: EventType,
    /// Vendor event type code, when the payload carried one
    pub vendor_type_id: Option<i64>,
    pub event_name: String,
    pub occurred_at: DateTime<Utc>,
    pub structured_fields: Map<String, Value>,
    pub parsed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub raw_event_id: i64,
    pub event_type: EventType,
    pub vendor_type_id: Option<i64>,
    pub event_name: String,
    pub occurred_at: DateTime<Utc>,
    pub structured_fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CgmReading {
    pub id: i64,
    pub event_id: i64,
    pub value: i64,
    pub unit: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCgmReading {
    pub event_id: i64,
    pub value: i64,
    pub unit: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasalDelivery {
    pub id: i64,
    pub event_id: i64,
    /// Effective delivery rate in units per hour
    pub rate: f64,
    /// Rates below are in milli-units per hour, as reported by the pump
    pub profile_rate: Option<i64>,
    pub algorithm_rate: Option<i64>,
    pub temp_rate: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBasalDelivery {
    pub event_id: i64,
    pub rate: f64,
    pub profile_rate: Option<i64>,
    pub algorithm_rate: Option<i64>,
    pub temp_rate: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

/// Derived table an extractor writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtractTarget {
    CgmReadings,
    BasalDeliveries,
}

impl ExtractTarget {
    /// Table name; doubles as the `target` column value for skips
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractTarget::CgmReadings => "cgm_readings",
            ExtractTarget::BasalDeliveries => "basal_deliveries",
        }
    }

    /// The only event type this target is derived from
    pub fn source_event_type(&self) -> EventType {
        match self {
            ExtractTarget::CgmReadings => EventType::CgmReading,
            ExtractTarget::BasalDeliveries => EventType::BasalDelivery,
        }
    }
}

impl fmt::Display for ExtractTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExtractTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cgm_readings" => Ok(ExtractTarget::CgmReadings),
            "basal_deliveries" => Ok(ExtractTarget::BasalDeliveries),
            other => Err(format!("Invalid extract target: {other}")),
        }
    }
}

/// Audit record for an event an extractor rejected as invalid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSkip {
    pub event_id: i64,
    pub target: ExtractTarget,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub stream_name: String,
    pub last_event_created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of committing one ingest batch together with its watermark
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatchOutcome {
    pub inserted: usize,
    /// Records whose external id and payload were already stored
    pub duplicates: usize,
    /// Records whose external id was stored with a different payload
    pub conflicts: usize,
    /// Watermark in effect after the commit
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

/// Row counts, for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub raw_events: u64,
    pub events: u64,
    pub unparsed_events: u64,
    pub cgm_readings: u64,
    pub basal_deliveries: u64,
    pub extraction_skips: u64,
    pub raw_event_conflicts: u64,
}
