use crate::api::ApiError;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Stage of a cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingest,
    Parse,
    ExtractCgm,
    ExtractBasal,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingest => "ingest",
            Stage::Parse => "parse",
            Stage::ExtractCgm => "extract_cgm",
            Stage::ExtractBasal => "extract_basal",
        };
        write!(f, "{name}")
    }
}

/// How the scheduler reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Retry on the next cycle
    Transient,
    /// An invariant would have been violated; nothing was written
    Consistency,
    /// Stop the scheduler
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Transient => "transient",
            Severity::Consistency => "consistency",
            Severity::Fatal => "fatal",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fetching stream {stream} since {since:?} failed after {pages_fetched} page(s): {source}")]
    Fetch {
        stream: String,
        since: Option<DateTime<Utc>>,
        pages_fetched: usize,
        #[source]
        source: ApiError,
    },

    #[error("Store error during {stage}: {source}")]
    Store {
        stage: Stage,
        stream: Option<String>,
        #[source]
        source: StoreError,
    },

    #[error("A cycle is already in progress")]
    CycleInProgress,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Scheduler halted by fatal error: {message}")]
    Halted {
        stage: Option<Stage>,
        message: String,
    },
}

impl PipelineError {
    pub fn store(stage: Stage, stream: Option<&str>, source: StoreError) -> Self {
        PipelineError::Store {
            stage,
            stream: stream.map(str::to_string),
            source,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            PipelineError::Fetch { .. } | PipelineError::CycleInProgress => Severity::Transient,
            PipelineError::Store { source, .. } if source.is_fatal() => Severity::Fatal,
            PipelineError::Store { source, .. } if source.is_consistency() => {
                Severity::Consistency
            }
            PipelineError::Store { .. } => Severity::Transient,
            PipelineError::Configuration(_) | PipelineError::Halted { .. } => Severity::Fatal,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Fetch { .. } => Some(Stage::Ingest),
            PipelineError::Store { stage, .. } => Some(*stage),
            PipelineError::Halted { stage, .. } => *stage,
            PipelineError::CycleInProgress | PipelineError::Configuration(_) => None,
        }
    }

    /// Messages of this error and every error it wraps, outermost first
    pub fn causes(&self) -> Vec<String> {
        let mut causes = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = current {
            causes.push(err.to_string());
            current = err.source();
        }
        causes
    }
}
