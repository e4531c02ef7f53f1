pub mod cycle;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod parser;
pub mod scheduler;

#[allow(unused_imports)]
pub use cycle::{CycleFailure, CycleResult, CycleStatus, DomainCounts, Pipeline, PipelineSettings};
#[allow(unused_imports)]
pub use error::{PipelineError, Severity, Stage};
pub use scheduler::{Scheduler, SchedulerState};
