use crate::store::error::StoreError;
#[cfg(test)]
use crate::store::models::{BasalDelivery, CgmReading};
use crate::store::models::{
    Event, EventType, ExtractOutcome, ExtractTarget, ExtractionSkip, NewBasalDelivery,
    NewCgmReading, NewEvent, NewRawEvent, RawBatchOutcome, RawEvent, StoreStats, Watermark,
};
use crate::store::store::PipelineStore;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::{debug, error, info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS raw_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stream TEXT NOT NULL,
        external_id TEXT NOT NULL UNIQUE,
        event_created_at TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        raw_payload BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_raw_events_stream ON raw_events(stream);

    CREATE TABLE IF NOT EXISTS raw_event_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stream TEXT NOT NULL,
        external_id TEXT NOT NULL,
        observed_at TEXT NOT NULL,
        conflicting_payload BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        raw_event_id INTEGER NOT NULL UNIQUE REFERENCES raw_events(id),
        event_type TEXT NOT NULL,
        vendor_type_id INTEGER,
        event_name TEXT NOT NULL,
        occurred_at TEXT NOT NULL,
        structured_fields TEXT NOT NULL,
        parsed_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type);

    CREATE TABLE IF NOT EXISTS cgm_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL UNIQUE REFERENCES events(id),
        value INTEGER NOT NULL,
        unit TEXT NOT NULL,
        occurred_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS basal_deliveries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL UNIQUE REFERENCES events(id),
        rate REAL NOT NULL,
        profile_rate INTEGER,
        algorithm_rate INTEGER,
        temp_rate INTEGER,
        duration_minutes INTEGER,
        occurred_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS extraction_skips (
        event_id INTEGER NOT NULL REFERENCES events(id),
        target TEXT NOT NULL,
        reason TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY (event_id, target)
    );

    CREATE TABLE IF NOT EXISTS watermarks (
        stream_name TEXT PRIMARY KEY,
        last_event_created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

const RAW_EVENT_COLUMNS: &str =
    "r.id, r.stream, r.external_id, r.event_created_at, r.fetched_at, r.raw_payload";

const EVENT_COLUMNS: &str = "e.id, e.raw_event_id, e.event_type, e.vendor_type_id, e.event_name, \
     e.occurred_at, e.structured_fields, e.parsed_at";

type RawEventRow = (i64, String, String, String, String, Vec<u8>);
type EventRow = (i64, i64, String, Option<i64>, String, String, String, String);

/// A SQLite implementation of the PipelineStore trait
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
    /// On-disk location; `None` for in-memory databases
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path. `:memory:` opens a
    /// private in-memory database.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        info!("Opening SQLite pipeline store at path: {db_path}");

        let in_memory = db_path == ":memory:";
        if !in_memory {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    debug!("Creating parent directory: {:?}", parent);
                    fs::create_dir_all(parent).map_err(|e| {
                        error!("Failed to create directory {parent:?}: {e}");
                        StoreError::OpenError(format!("Failed to create directory: {e}"))
                    })?;
                }
            }
        }

        let connection = Connection::open(db_path).map_err(|e| {
            error!("Failed to open SQLite database at {db_path}: {e}");
            StoreError::OpenError(format!("Failed to open SQLite database: {e}"))
        })?;

        connection
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StoreError::OpenError(format!("Failed to enable foreign keys: {e}")))?;

        connection.execute_batch(SCHEMA).map_err(|e| {
            error!("Failed to create pipeline schema: {e}");
            StoreError::OpenError(format!("Failed to create schema: {e}"))
        })?;

        info!("SQLite pipeline store initialized successfully at: {db_path}");
        Ok(SqliteStore {
            connection: Arc::new(Mutex::new(connection)),
            path: (!in_memory).then(|| PathBuf::from(db_path)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn run_blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);

        task::spawn_blocking(move || {
            let mut conn = match connection.lock() {
                Ok(conn) => conn,
                Err(_) => {
                    error!("Failed to acquire database lock");
                    return Err(StoreError::Locked);
                }
            };
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            error!("Task panic while {operation}: {e}");
            StoreError::OperationError(format!("Task panic: {e}"))
        })?
    }

    fn datetime_to_string(dt: DateTime<Utc>) -> String {
        // Fixed-width UTC form so lexical order matches chronological order
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::OperationError(format!("Failed to parse datetime: {e}")))
    }

    fn read_raw_event_row(row: &Row<'_>) -> rusqlite::Result<RawEventRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn raw_event_from_row(row: RawEventRow) -> Result<RawEvent, StoreError> {
        let (id, stream, external_id, created_at, fetched_at, payload) = row;
        Ok(RawEvent {
            id,
            stream,
            external_id,
            event_created_at: Self::string_to_datetime(&created_at)?,
            fetched_at: Self::string_to_datetime(&fetched_at)?,
            raw_payload: Bytes::from(payload),
        })
    }

    fn read_event_row(row: &Row<'_>) -> rusqlite::Result<EventRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn event_from_row(row: EventRow) -> Result<Event, StoreError> {
        let (id, raw_event_id, event_type, vendor_type_id, event_name, occurred_at, fields, parsed_at) =
            row;
        let event_type = EventType::from_str(&event_type).map_err(StoreError::OperationError)?;
        let structured_fields = match serde_json::from_str::<Value>(&fields) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(StoreError::OperationError(format!(
                    "Structured fields of event {id} are not a JSON object"
                )))
            }
            Err(e) => {
                error!("Failed to parse structured fields of event {id}: {e}");
                return Err(StoreError::OperationError(format!(
                    "Failed to parse structured fields: {e}"
                )));
            }
        };

        Ok(Event {
            id,
            raw_event_id,
            event_type,
            vendor_type_id,
            event_name,
            occurred_at: Self::string_to_datetime(&occurred_at)?,
            structured_fields,
            parsed_at: Self::string_to_datetime(&parsed_at)?,
        })
    }

    fn fields_to_string(fields: &Map<String, Value>) -> Result<String, StoreError> {
        serde_json::to_string(fields).map_err(|e| {
            StoreError::OperationError(format!("Failed to serialize structured fields: {e}"))
        })
    }

    fn query_events(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Event>, StoreError> {
        let mut stmt = conn.prepare(sql).map_err(op_error("Failed to prepare event query"))?;
        let rows = stmt
            .query_map(params, Self::read_event_row)
            .map_err(op_error("Failed to query events"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(op_error("Failed to read event row"))?;
        rows.into_iter().map(Self::event_from_row).collect()
    }

    fn query_raw_events(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RawEvent>, StoreError> {
        let mut stmt = conn
            .prepare(sql)
            .map_err(op_error("Failed to prepare raw event query"))?;
        let rows = stmt
            .query_map(params, Self::read_raw_event_row)
            .map_err(op_error("Failed to query raw events"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(op_error("Failed to read raw event row"))?;
        rows.into_iter().map(Self::raw_event_from_row).collect()
    }

    fn read_watermarks(conn: &Connection) -> Result<Vec<Watermark>, StoreError> {
        let mut stmt = conn
            .prepare(
                "SELECT stream_name, last_event_created_at, updated_at
                 FROM watermarks ORDER BY stream_name",
            )
            .map_err(op_error("Failed to prepare watermark query"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(op_error("Failed to query watermarks"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(op_error("Failed to read watermark row"))?;

        rows.into_iter()
            .map(|(stream_name, last, updated)| {
                Ok(Watermark {
                    stream_name,
                    last_event_created_at: Self::string_to_datetime(&last)?,
                    updated_at: Self::string_to_datetime(&updated)?,
                })
            })
            .collect()
    }

    fn count(conn: &Connection, sql: &str) -> Result<u64, StoreError> {
        conn.query_row(sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n.max(0) as u64)
            .map_err(op_error("Failed to count rows"))
    }

    fn insert_skips(
        tx: &rusqlite::Transaction<'_>,
        skips: &[ExtractionSkip],
    ) -> Result<usize, StoreError> {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO extraction_skips (event_id, target, reason, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(event_id, target) DO NOTHING",
            )
            .map_err(op_error("Failed to prepare skip insert"))?;

        let mut inserted = 0;
        for skip in skips {
            inserted += stmt
                .execute(params![
                    skip.event_id,
                    skip.target.as_str(),
                    skip.reason,
                    Self::datetime_to_string(skip.recorded_at)
                ])
                .map_err(op_error("Failed to insert extraction skip"))?;
        }
        Ok(inserted)
    }
}

fn op_error(context: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| {
        error!("{context}: {e}");
        StoreError::OperationError(format!("{context}: {e}"))
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            if !path.exists() {
                error!("SQLite database file is missing: {}", path.display());
                return Err(StoreError::Unavailable(format!(
                    "database file {} no longer exists",
                    path.display()
                )));
            }
        }

        self.run_blocking("pinging store", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(format!("Connectivity check failed: {e}")))
        })
        .await
    }

    async fn get_watermark(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        debug!("Getting watermark for stream: {stream}");
        let stream = stream.to_string();

        self.run_blocking("getting watermark", move |conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT last_event_created_at FROM watermarks WHERE stream_name = ?1",
                    params![stream],
                    |row| row.get(0),
                )
                .optional()
                .map_err(op_error("Failed to query watermark"))?;
            value.map(|s| Self::string_to_datetime(&s)).transpose()
        })
        .await
    }

    async fn list_watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        self.run_blocking("listing watermarks", |conn| Self::read_watermarks(conn))
            .await
    }

    async fn commit_raw_batch(
        &self,
        stream: &str,
        records: Vec<NewRawEvent>,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<RawBatchOutcome, StoreError> {
        debug!(
            "Committing raw batch: stream={stream}, records={}, watermark={:?}",
            records.len(),
            watermark
        );
        let stream = stream.to_string();

        self.run_blocking("committing raw batch", move |conn| {
            let tx = conn
                .transaction()
                .map_err(op_error("Failed to begin transaction"))?;

            let current: Option<String> = tx
                .query_row(
                    "SELECT last_event_created_at FROM watermarks WHERE stream_name = ?1",
                    params![stream],
                    |row| row.get(0),
                )
                .optional()
                .map_err(op_error("Failed to query watermark"))?;
            let current = current.map(|s| Self::string_to_datetime(&s)).transpose()?;

            if let (Some(current), Some(attempted)) = (current, watermark) {
                if attempted < current {
                    warn!("Rejecting watermark regression for {stream}: {current} -> {attempted}");
                    return Err(StoreError::WatermarkRegression {
                        stream,
                        current,
                        attempted,
                    });
                }
            }

            let mut outcome = RawBatchOutcome::default();
            {
                let mut select = tx
                    .prepare_cached("SELECT raw_payload FROM raw_events WHERE external_id = ?1")
                    .map_err(op_error("Failed to prepare raw event lookup"))?;
                let mut insert = tx
                    .prepare_cached(
                        "INSERT INTO raw_events (stream, external_id, event_created_at, fetched_at, raw_payload)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(op_error("Failed to prepare raw event insert"))?;
                let mut conflict = tx
                    .prepare_cached(
                        "INSERT INTO raw_event_conflicts (stream, external_id, observed_at, conflicting_payload)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(op_error("Failed to prepare conflict insert"))?;

                for record in &records {
                    let existing: Option<Vec<u8>> = select
                        .query_row(params![record.external_id], |row| row.get(0))
                        .optional()
                        .map_err(op_error("Failed to look up raw event"))?;

                    match existing {
                        None => {
                            insert
                                .execute(params![
                                    record.stream,
                                    record.external_id,
                                    Self::datetime_to_string(record.event_created_at),
                                    Self::datetime_to_string(record.fetched_at),
                                    record.raw_payload.as_ref()
                                ])
                                .map_err(op_error("Failed to insert raw event"))?;
                            outcome.inserted += 1;
                        }
                        Some(stored) if stored.as_slice() == record.raw_payload.as_ref() => {
                            outcome.duplicates += 1;
                        }
                        Some(_) => {
                            warn!(
                                "Raw event {} re-fetched with a different payload; keeping stored copy",
                                record.external_id
                            );
                            conflict
                                .execute(params![
                                    record.stream,
                                    record.external_id,
                                    Self::datetime_to_string(record.fetched_at),
                                    record.raw_payload.as_ref()
                                ])
                                .map_err(op_error("Failed to record raw event conflict"))?;
                            outcome.conflicts += 1;
                        }
                    }
                }
            }

            outcome.watermark = match (current, watermark) {
                (Some(current), Some(new)) if new <= current => Some(current),
                (_, Some(new)) => {
                    tx.execute(
                        "INSERT INTO watermarks (stream_name, last_event_created_at, updated_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(stream_name) DO UPDATE SET
                            last_event_created_at = excluded.last_event_created_at,
                            updated_at = excluded.updated_at",
                        params![
                            stream,
                            Self::datetime_to_string(new),
                            Self::datetime_to_string(Utc::now())
                        ],
                    )
                    .map_err(op_error("Failed to update watermark"))?;
                    Some(new)
                }
                (current, None) => current,
            };

            tx.commit().map_err(op_error("Failed to commit raw batch"))?;

            debug!(
                "Committed raw batch for {stream}: inserted={}, duplicates={}, conflicts={}",
                outcome.inserted, outcome.duplicates, outcome.conflicts
            );
            Ok(outcome)
        })
        .await
    }

    async fn get_raw_events_without_event(
        &self,
        limit: usize,
    ) -> Result<Vec<RawEvent>, StoreError> {
        self.run_blocking("getting unparsed raw events", move |conn| {
            let sql = format!(
                "SELECT {RAW_EVENT_COLUMNS} FROM raw_events r
                 LEFT JOIN events e ON e.raw_event_id = r.id
                 WHERE e.id IS NULL
                 ORDER BY r.id
                 LIMIT ?1"
            );
            Self::query_raw_events(conn, &sql, params![limit as i64])
        })
        .await
    }

    async fn get_raw_event(&self, id: i64) -> Result<Option<RawEvent>, StoreError> {
        self.run_blocking("getting raw event", move |conn| {
            let sql = format!("SELECT {RAW_EVENT_COLUMNS} FROM raw_events r WHERE r.id = ?1");
            Ok(Self::query_raw_events(conn, &sql, params![id])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn insert_events(&self, events: Vec<NewEvent>) -> Result<usize, StoreError> {
        debug!("Inserting {} parsed events", events.len());

        self.run_blocking("inserting events", move |conn| {
            let tx = conn
                .transaction()
                .map_err(op_error("Failed to begin transaction"))?;
            let parsed_at = Self::datetime_to_string(Utc::now());

            let mut inserted = 0;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO events (raw_event_id, event_type, vendor_type_id, event_name, occurred_at, structured_fields, parsed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(raw_event_id) DO NOTHING",
                    )
                    .map_err(op_error("Failed to prepare event insert"))?;

                for event in &events {
                    inserted += stmt
                        .execute(params![
                            event.raw_event_id,
                            event.event_type.as_str(),
                            event.vendor_type_id,
                            event.event_name,
                            Self::datetime_to_string(event.occurred_at),
                            Self::fields_to_string(&event.structured_fields)?,
                            parsed_at
                        ])
                        .map_err(op_error("Failed to insert event"))?;
                }
            }

            tx.commit().map_err(op_error("Failed to commit events"))?;
            Ok(inserted)
        })
        .await
    }

    async fn get_unparsed_events(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.run_blocking("getting unparsed events", move |conn| {
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e
                 WHERE e.event_type = ?1 AND e.id > ?2
                 ORDER BY e.id
                 LIMIT ?3"
            );
            Self::query_events(
                conn,
                &sql,
                params![EventType::Unparsed.as_str(), after_id, limit as i64],
            )
        })
        .await
    }

    async fn replace_unparsed_event(
        &self,
        event_id: i64,
        event: NewEvent,
    ) -> Result<bool, StoreError> {
        debug!("Replacing unparsed event {event_id} with {}", event.event_type);

        self.run_blocking("replacing unparsed event", move |conn| {
            let rows = conn
                .execute(
                    "UPDATE events
                     SET event_type = ?1, vendor_type_id = ?2, event_name = ?3,
                         occurred_at = ?4, structured_fields = ?5, parsed_at = ?6
                     WHERE id = ?7 AND raw_event_id = ?8 AND event_type = ?9",
                    params![
                        event.event_type.as_str(),
                        event.vendor_type_id,
                        event.event_name,
                        Self::datetime_to_string(event.occurred_at),
                        Self::fields_to_string(&event.structured_fields)?,
                        Self::datetime_to_string(Utc::now()),
                        event_id,
                        event.raw_event_id,
                        EventType::Unparsed.as_str()
                    ],
                )
                .map_err(op_error("Failed to replace unparsed event"))?;

            if rows > 0 {
                return Ok(true);
            }

            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM events WHERE id = ?1",
                    params![event_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(op_error("Failed to look up event"))?;
            match exists {
                Some(_) => Ok(false),
                None => {
                    warn!("Event not found for reclassification: id={event_id}");
                    Err(StoreError::EventNotFound(event_id))
                }
            }
        })
        .await
    }

    async fn get_events_pending_extraction(
        &self,
        target: ExtractTarget,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        self.run_blocking("getting events pending extraction", move |conn| {
            let table = target.as_str();
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events e
                 LEFT JOIN {table} d ON d.event_id = e.id
                 LEFT JOIN extraction_skips s ON s.event_id = e.id AND s.target = ?1
                 WHERE e.event_type = ?2 AND d.id IS NULL AND s.event_id IS NULL
                 ORDER BY e.id
                 LIMIT ?3"
            );
            Self::query_events(
                conn,
                &sql,
                params![
                    target.as_str(),
                    target.source_event_type().as_str(),
                    limit as i64
                ],
            )
        })
        .await
    }

    async fn commit_cgm_readings(
        &self,
        readings: Vec<NewCgmReading>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError> {
        debug!(
            "Committing {} CGM readings and {} skips",
            readings.len(),
            skips.len()
        );

        self.run_blocking("committing CGM readings", move |conn| {
            let tx = conn
                .transaction()
                .map_err(op_error("Failed to begin transaction"))?;

            let mut outcome = ExtractOutcome::default();
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO cgm_readings (event_id, value, unit, occurred_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(event_id) DO NOTHING",
                    )
                    .map_err(op_error("Failed to prepare CGM reading insert"))?;
                for reading in &readings {
                    outcome.inserted += stmt
                        .execute(params![
                            reading.event_id,
                            reading.value,
                            reading.unit,
                            Self::datetime_to_string(reading.occurred_at)
                        ])
                        .map_err(op_error("Failed to insert CGM reading"))?;
                }
            }
            outcome.skipped = Self::insert_skips(&tx, &skips)?;

            tx.commit().map_err(op_error("Failed to commit CGM readings"))?;
            Ok(outcome)
        })
        .await
    }

    async fn commit_basal_deliveries(
        &self,
        deliveries: Vec<NewBasalDelivery>,
        skips: Vec<ExtractionSkip>,
    ) -> Result<ExtractOutcome, StoreError> {
        debug!(
            "Committing {} basal deliveries and {} skips",
            deliveries.len(),
            skips.len()
        );

        self.run_blocking("committing basal deliveries", move |conn| {
            let tx = conn
                .transaction()
                .map_err(op_error("Failed to begin transaction"))?;

            let mut outcome = ExtractOutcome::default();
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO basal_deliveries (event_id, rate, profile_rate, algorithm_rate, temp_rate, duration_minutes, occurred_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(event_id) DO NOTHING",
                    )
                    .map_err(op_error("Failed to prepare basal delivery insert"))?;
                for delivery in &deliveries {
                    outcome.inserted += stmt
                        .execute(params![
                            delivery.event_id,
                            delivery.rate,
                            delivery.profile_rate,
                            delivery.algorithm_rate,
                            delivery.temp_rate,
                            delivery.duration_minutes,
                            Self::datetime_to_string(delivery.occurred_at)
                        ])
                        .map_err(op_error("Failed to insert basal delivery"))?;
                }
            }
            outcome.skipped = Self::insert_skips(&tx, &skips)?;

            tx.commit()
                .map_err(op_error("Failed to commit basal deliveries"))?;
            Ok(outcome)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.run_blocking("collecting stats", |conn| {
            Ok(StoreStats {
                raw_events: Self::count(conn, "SELECT COUNT(*) FROM raw_events")?,
                events: Self::count(conn, "SELECT COUNT(*) FROM events")?,
                unparsed_events: Self::count(
                    conn,
                    "SELECT COUNT(*) FROM events WHERE event_type = 'unparsed'",
                )?,
                cgm_readings: Self::count(conn, "SELECT COUNT(*) FROM cgm_readings")?,
                basal_deliveries: Self::count(conn, "SELECT COUNT(*) FROM basal_deliveries")?,
                extraction_skips: Self::count(conn, "SELECT COUNT(*) FROM extraction_skips")?,
                raw_event_conflicts: Self::count(conn, "SELECT COUNT(*) FROM raw_event_conflicts")?,
            })
        })
        .await
    }

    #[cfg(test)]
    async fn list_raw_events(&self, stream: &str) -> Result<Vec<RawEvent>, StoreError> {
        let stream = stream.to_string();
        self.run_blocking("listing raw events", move |conn| {
            let sql =
                format!("SELECT {RAW_EVENT_COLUMNS} FROM raw_events r WHERE r.stream = ?1 ORDER BY r.id");
            Self::query_raw_events(conn, &sql, params![stream])
        })
        .await
    }

    #[cfg(test)]
    async fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        self.run_blocking("listing events", |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events e ORDER BY e.id");
            Self::query_events(conn, &sql, [])
        })
        .await
    }

    #[cfg(test)]
    async fn list_cgm_readings(&self) -> Result<Vec<CgmReading>, StoreError> {
        self.run_blocking("listing CGM readings", |conn| {
            let mut stmt = conn
                .prepare("SELECT id, event_id, value, unit, occurred_at FROM cgm_readings ORDER BY id")
                .map_err(op_error("Failed to prepare CGM query"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(op_error("Failed to query CGM readings"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(op_error("Failed to read CGM row"))?;
            rows.into_iter()
                .map(|(id, event_id, value, unit, occurred_at)| {
                    Ok(CgmReading {
                        id,
                        event_id,
                        value,
                        unit,
                        occurred_at: Self::string_to_datetime(&occurred_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    #[cfg(test)]
    async fn list_basal_deliveries(&self) -> Result<Vec<BasalDelivery>, StoreError> {
        self.run_blocking("listing basal deliveries", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, event_id, rate, profile_rate, algorithm_rate, temp_rate, duration_minutes, occurred_at
                     FROM basal_deliveries ORDER BY id",
                )
                .map_err(op_error("Failed to prepare basal query"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })
                .map_err(op_error("Failed to query basal deliveries"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(op_error("Failed to read basal row"))?;
            rows.into_iter()
                .map(
                    |(id, event_id, rate, profile_rate, algorithm_rate, temp_rate, duration_minutes, occurred_at)| {
                        Ok(BasalDelivery {
                            id,
                            event_id,
                            rate,
                            profile_rate,
                            algorithm_rate,
                            temp_rate,
                            duration_minutes,
                            occurred_at: Self::string_to_datetime(&occurred_at)?,
                        })
                    },
                )
                .collect()
        })
        .await
    }

    #[cfg(test)]
    async fn list_extraction_skips(
        &self,
        target: ExtractTarget,
    ) -> Result<Vec<ExtractionSkip>, StoreError> {
        self.run_blocking("listing extraction skips", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT event_id, target, reason, recorded_at FROM extraction_skips
                     WHERE target = ?1 ORDER BY event_id",
                )
                .map_err(op_error("Failed to prepare skip query"))?;
            let rows = stmt
                .query_map(params![target.as_str()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(op_error("Failed to query extraction skips"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(op_error("Failed to read skip row"))?;
            rows.into_iter()
                .map(|(event_id, target, reason, recorded_at)| {
                    Ok(ExtractionSkip {
                        event_id,
                        target: ExtractTarget::from_str(&target)
                            .map_err(StoreError::OperationError)?,
                        reason,
                        recorded_at: Self::string_to_datetime(&recorded_at)?,
                    })
                })
                .collect()
        })
        .await
    }
}
