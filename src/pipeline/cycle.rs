use crate::api::EventSource;
use crate::config::{Config, MAX_LOOKBACK_MINUTES};
use crate::pipeline::error::{PipelineError, Severity, Stage};
use crate::pipeline::extract::Extractor;
use crate::pipeline::ingest::Ingestor;
use crate::pipeline::parser::{Parser, ReparseReport};
use crate::store::{ExtractTarget, PipelineStore, StoreError, StoreStats, Watermark};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Tunables for one pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub request_timeout: Duration,
    pub lookback: chrono::Duration,
    pub parse_batch_size: usize,
    pub extract_batch_size: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        PipelineSettings {
            request_timeout: Duration::from_secs(config.api.request_timeout_secs),
            lookback: chrono::Duration::minutes(
                config.pipeline.lookback_minutes.min(MAX_LOOKBACK_MINUTES) as i64,
            ),
            parse_batch_size: config.pipeline.parse_batch_size,
            extract_batch_size: config.pipeline.extract_batch_size,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            request_timeout: Duration::from_secs(30),
            lookback: chrono::Duration::zero(),
            parse_batch_size: 1000,
            extract_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Succeeded,
    Failed,
    /// Stopped at a safe point because cancellation was requested
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainCounts {
    pub cgm_readings: usize,
    pub basal_deliveries: usize,
    /// Events recorded as skipped by any extractor
    pub skipped_invalid: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleFailure {
    pub stage: Option<Stage>,
    pub severity: Severity,
    pub message: String,
    /// Error chain, outermost first
    pub causes: Vec<String>,
}

/// Summary of one cycle for one stream
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub cycle_id: Uuid,
    pub stream: String,
    pub status: CycleStatus,
    pub new_raw_count: usize,
    pub new_event_count: usize,
    pub new_domain_counts: DomainCounts,
    pub conflicts: usize,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    pub error: Option<CycleFailure>,
    pub duration: Duration,
}

impl CycleResult {
    fn new(stream: &str) -> Self {
        CycleResult {
            cycle_id: Uuid::new_v4(),
            stream: stream.to_string(),
            status: CycleStatus::Succeeded,
            new_raw_count: 0,
            new_event_count: 0,
            new_domain_counts: DomainCounts::default(),
            conflicts: 0,
            watermark_before: None,
            watermark_after: None,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(&self.error, Some(failure) if failure.severity == Severity::Fatal)
    }
}

/// Runs Ingest, Parse, ExtractCgm and ExtractBasal as one cycle. Cycles never
/// overlap.
pub struct Pipeline<A: EventSource, S: PipelineStore> {
    store: Arc<S>,
    ingestor: Ingestor<A, S>,
    parser: Parser<S>,
    extractor: Extractor<S>,
    cycle_lock: Mutex<()>,
    cancel: watch::Receiver<bool>,
}

impl<A: EventSource, S: PipelineStore> Pipeline<A, S> {
    pub fn new(source: Arc<A>, store: Arc<S>, settings: PipelineSettings) -> Self {
        // A sender-less receiver never reports cancellation
        let (_cancel_tx, cancel) = watch::channel(false);
        Pipeline {
            ingestor: Ingestor::new(
                source,
                Arc::clone(&store),
                settings.request_timeout,
                settings.lookback,
            ),
            parser: Parser::new(Arc::clone(&store), settings.parse_batch_size),
            extractor: Extractor::new(Arc::clone(&store), settings.extract_batch_size),
            store,
            cycle_lock: Mutex::new(()),
            cancel,
        }
    }

    /// Observe `cancel` between stages and between batches
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run one cycle for `stream`, waiting for any in-flight cycle to finish
    pub async fn run_cycle(&self, stream: &str) -> CycleResult {
        let _guard = self.cycle_lock.lock().await;
        self.execute(stream).await
    }

    /// Run one cycle for `stream`, or fail with `CycleInProgress` if one is
    /// already running
    pub async fn try_run_cycle(&self, stream: &str) -> Result<CycleResult, PipelineError> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| PipelineError::CycleInProgress)?;
        Ok(self.execute(stream).await)
    }

    /// Row counts of every table
    pub async fn status(&self) -> Result<StoreStats, StoreError> {
        self.store.stats().await
    }

    /// Watermarks of every stream that has ingested at least one record
    pub async fn watermarks(&self) -> Result<Vec<Watermark>, StoreError> {
        self.store.list_watermarks().await
    }

    /// Reclassify `Unparsed` events the parser now recognises
    pub async fn reparse(&self) -> Result<ReparseReport, PipelineError> {
        let _guard = self.cycle_lock.lock().await;
        self.parser.reparse_unrecognized(&self.cancel).await
    }

    async fn execute(&self, stream: &str) -> CycleResult {
        let started = Instant::now();
        let mut result = CycleResult::new(stream);
        info!("Cycle {} started for stream {stream}", result.cycle_id);

        match self.run_stages(stream, &mut result).await {
            Ok(()) => {}
            Err(err) => {
                let severity = err.severity();
                let failure = CycleFailure {
                    stage: err.stage(),
                    severity,
                    message: err.to_string(),
                    causes: err.causes(),
                };
                match severity {
                    Severity::Transient => {
                        warn!("Cycle {} failed ({severity}): {err}", result.cycle_id)
                    }
                    Severity::Consistency | Severity::Fatal => {
                        error!("Cycle {} failed ({severity}): {err}", result.cycle_id)
                    }
                }
                result.status = CycleStatus::Failed;
                result.error = Some(failure);
            }
        }

        result.duration = started.elapsed();
        info!(
            "Cycle {} finished for stream {stream}: status={:?}, raw={}, events={}, cgm={}, basal={}, skipped={}, duration={:?}",
            result.cycle_id,
            result.status,
            result.new_raw_count,
            result.new_event_count,
            result.new_domain_counts.cgm_readings,
            result.new_domain_counts.basal_deliveries,
            result.new_domain_counts.skipped_invalid,
            result.duration
        );
        result
    }

    async fn run_stages(
        &self,
        stream: &str,
        result: &mut CycleResult,
    ) -> Result<(), PipelineError> {
        if self.is_cancelled() {
            result.status = CycleStatus::Cancelled;
            return Ok(());
        }

        let store_error = |e| PipelineError::store(Stage::Ingest, Some(stream), e);
        self.store.ping().await.map_err(store_error)?;
        result.watermark_before = self.store.get_watermark(stream).await.map_err(store_error)?;
        result.watermark_after = result.watermark_before;

        let ingest = self.ingestor.ingest(stream).await?;
        result.new_raw_count = ingest.inserted;
        result.conflicts = ingest.conflicts;
        result.watermark_before = ingest.watermark_before;
        result.watermark_after = ingest.watermark_after;
        if self.is_cancelled() {
            result.status = CycleStatus::Cancelled;
            return Ok(());
        }

        let parse = self.parser.parse_pending(&self.cancel).await?;
        result.new_event_count = parse.inserted;
        if parse.cancelled || self.is_cancelled() {
            result.status = CycleStatus::Cancelled;
            return Ok(());
        }

        for target in [ExtractTarget::CgmReadings, ExtractTarget::BasalDeliveries] {
            let extract = self.extractor.run(target, &self.cancel).await?;
            match target {
                ExtractTarget::CgmReadings => {
                    result.new_domain_counts.cgm_readings = extract.inserted
                }
                ExtractTarget::BasalDeliveries => {
                    result.new_domain_counts.basal_deliveries = extract.inserted
                }
            }
            result.new_domain_counts.skipped_invalid += extract.skipped;
            if extract.cancelled || self.is_cancelled() {
                result.status = CycleStatus::Cancelled;
                return Ok(());
            }
        }

        Ok(())
    }
}
