use crate::api::EventSource;
use crate::config::{MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};
use crate::pipeline::cycle::{CycleResult, CycleStatus, Pipeline};
use crate::pipeline::error::PipelineError;
use crate::store::PipelineStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Waiting,
    Stopped,
}

/// Drives pipeline cycles on a fixed interval until cancelled or a fatal
/// error occurs
///
/// The interval runs on the monotonic clock from the end of one iteration
/// to the start of the next, so wall-clock jumps never shorten or stretch it.
pub struct Scheduler<A: EventSource, S: PipelineStore> {
    pipeline: Arc<Pipeline<A, S>>,
    interval: Duration,
    streams: Vec<String>,
    state: watch::Sender<SchedulerState>,
}

impl<A: EventSource, S: PipelineStore> Scheduler<A, S> {
    pub fn new(
        pipeline: Arc<Pipeline<A, S>>,
        interval_minutes: u64,
        streams: Vec<String>,
    ) -> Result<Self, PipelineError> {
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
            return Err(PipelineError::Configuration(format!(
                "interval_minutes must be between {MIN_INTERVAL_MINUTES} and {MAX_INTERVAL_MINUTES}, got {interval_minutes}"
            )));
        }
        if streams.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one stream must be configured".to_string(),
            ));
        }

        let (state, _) = watch::channel(SchedulerState::Idle);
        Ok(Scheduler {
            pipeline,
            interval: Duration::from_secs(interval_minutes * 60),
            streams,
            state,
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SchedulerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Scheduler state {previous:?} -> {next:?}");
        }
    }

    /// Run cycles until `cancel` flips to true (returns `Ok`) or a cycle
    /// fails fatally (returns `Halted`). Every cycle result is sent on
    /// `results`; a dropped receiver does not stop the scheduler.
    pub async fn run_forever(
        &mut self,
        mut cancel: watch::Receiver<bool>,
        results: mpsc::Sender<CycleResult>,
    ) -> Result<(), PipelineError> {
        info!(
            "Scheduler starting: interval={}s, streams={:?}",
            self.interval.as_secs(),
            self.streams
        );

        loop {
            if *cancel.borrow() {
                self.stop();
                return Ok(());
            }

            self.transition(SchedulerState::Running);
            let mut halted = None;
            for stream in &self.streams {
                if *cancel.borrow() {
                    break;
                }

                let result = self.pipeline.run_cycle(stream).await;
                if let Some(next) = state_after(result.status) {
                    self.transition(next);
                }
                if result.is_fatal() {
                    halted = result.error.as_ref().map(|failure| PipelineError::Halted {
                        stage: failure.stage,
                        message: failure.message.clone(),
                    });
                }

                if results.send(result).await.is_err() {
                    debug!("Cycle result receiver dropped");
                }
                if halted.is_some() {
                    break;
                }
            }

            if let Some(err) = halted {
                error!("Stopping scheduler: {err}");
                self.transition(SchedulerState::Stopped);
                return Err(err);
            }
            if *cancel.borrow() {
                self.stop();
                return Ok(());
            }

            self.transition(SchedulerState::Waiting);
            let deadline = Instant::now() + self.interval;
            debug!("Next cycle in {}s", self.interval.as_secs());
            loop {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            self.stop();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn stop(&self) {
        info!("Scheduler stopped");
        self.transition(SchedulerState::Stopped);
    }
}

/// State published once a cycle finishes. A cancelled cycle publishes
/// nothing; the scheduler moves straight on to `Stopped`.
fn state_after(status: CycleStatus) -> Option<SchedulerState> {
    match status {
        CycleStatus::Succeeded => Some(SchedulerState::Succeeded),
        CycleStatus::Failed => Some(SchedulerState::Failed),
        CycleStatus::Cancelled => None,
    }
}
