// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::process;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

mod api;
mod config;
mod logging;
mod pipeline;
mod store;
#[cfg(test)]
mod test_utils;

use crate::api::HttpEventSource;
use crate::pipeline::{
    CycleResult, CycleStatus, Pipeline, PipelineSettings, Scheduler, SchedulerState,
};
use crate::store::SqliteStore;

type LivePipeline = Pipeline<HttpEventSource, SqliteStore>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = "config.toml",
        global = true
    )]
    config: String,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run cycles on a fixed interval until interrupted
    Run {
        /// Minutes between the end of one cycle and the start of the next
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Run a single cycle and exit
    Once {
        /// Stream to fetch; defaults to every configured stream
        #[arg(long)]
        stream: Option<String>,
    },
    /// Reclassify events the parser previously could not recognise
    Reparse,
    /// Print watermarks and row counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;
    if let Commands::Run {
        interval: Some(minutes),
    } = &cli.command
    {
        config.pipeline.interval_minutes = *minutes;
        config
            .validate()
            .context("Invalid --interval override")?;
    }

    let _log_guard = logging::init_logging(config.logging.as_ref(), cli.verbose)?;
    info!("Pump data pipeline v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", cli.config);

    match cli.command {
        Commands::Run { .. } => run_scheduler(config).await,
        Commands::Once { stream } => run_once(config, stream).await,
        Commands::Reparse => reparse(config).await,
        Commands::Status => status(config).await,
    }
}

fn initialize_pipeline(config: &config::Config) -> Result<LivePipeline> {
    let store = SqliteStore::new(&config.store.db_path)
        .with_context(|| format!("Failed to open store at {}", config.store.db_path))?;
    let source = HttpEventSource::new(&config.api).context("Failed to create API client")?;
    let pipeline = Pipeline::new(
        Arc::new(source),
        Arc::new(store),
        PipelineSettings::from_config(config),
    );

    info!("Pipeline initialized");
    Ok(pipeline)
}

fn log_result(result: &CycleResult) {
    match (&result.status, &result.error) {
        (CycleStatus::Failed, Some(failure)) => {
            error!(
                "Cycle {} for {} failed at {:?} ({}): {}",
                result.cycle_id,
                result.stream,
                failure.stage,
                failure.severity,
                failure.causes.join(": ")
            );
        }
        (CycleStatus::Cancelled, _) => {
            warn!("Cycle {} for {} was cancelled", result.cycle_id, result.stream);
        }
        _ => {
            info!(
                "Cycle {} for {}: raw={}, events={}, cgm={}, basal={}, skipped={}, conflicts={}, watermark={:?}",
                result.cycle_id,
                result.stream,
                result.new_raw_count,
                result.new_event_count,
                result.new_domain_counts.cgm_readings,
                result.new_domain_counts.basal_deliveries,
                result.new_domain_counts.skipped_invalid,
                result.conflicts,
                result.watermark_after
            );
        }
    }
}

/// Run the scheduler until Ctrl-C or a fatal error
async fn run_scheduler(config: config::Config) -> Result<()> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pipeline = Arc::new(initialize_pipeline(&config)?.with_cancellation(cancel_rx.clone()));
    let mut scheduler = Scheduler::new(
        pipeline,
        config.pipeline.interval_minutes,
        config.pipeline.streams.clone(),
    )?;

    let mut states = scheduler.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            debug!("Scheduler is now {state:?}");
            if state == SchedulerState::Stopped {
                break;
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current unit of work");
            let _ = cancel_tx.send(true);
        }
    });

    let (results_tx, mut results_rx) = mpsc::channel(16);
    let reporter = tokio::spawn(async move {
        while let Some(result) = results_rx.recv().await {
            log_result(&result);
        }
    });

    let outcome = scheduler.run_forever(cancel_rx, results_tx).await;
    let _ = reporter.await;
    info!("Scheduler finished in state {:?}", scheduler.state());

    if let Err(e) = outcome {
        error!("Scheduler stopped: {}", e);
        process::exit(1);
    }
    Ok(())
}

/// Run one cycle per requested stream. Never queues behind another cycle.
async fn run_once(config: config::Config, stream: Option<String>) -> Result<()> {
    let pipeline = initialize_pipeline(&config)?;
    let streams = match stream {
        Some(stream) => vec![stream],
        None => config.pipeline.streams.clone(),
    };

    let mut failed = false;
    for stream in &streams {
        let result = pipeline.try_run_cycle(stream).await?;
        log_result(&result);
        if result.status == CycleStatus::Failed {
            failed = true;
            if result.is_fatal() {
                break;
            }
        }
    }

    if failed {
        process::exit(1);
    }
    Ok(())
}

async fn reparse(config: config::Config) -> Result<()> {
    let pipeline = initialize_pipeline(&config)?;

    info!("Reparsing unrecognised events...");
    let report = pipeline.reparse().await?;
    info!(
        "Reparse finished: examined={}, reclassified={}",
        report.examined, report.reclassified
    );
    Ok(())
}

async fn status(config: config::Config) -> Result<()> {
    let pipeline = initialize_pipeline(&config)?;
    let stats = pipeline.status().await?;
    let watermarks = pipeline.watermarks().await?;

    for watermark in &watermarks {
        println!(
            "watermark {}: {} (updated {})",
            watermark.stream_name, watermark.last_event_created_at, watermark.updated_at
        );
    }
    println!("raw_events:          {}", stats.raw_events);
    println!("raw_event_conflicts: {}", stats.raw_event_conflicts);
    println!("events:              {}", stats.events);
    println!("unparsed_events:     {}", stats.unparsed_events);
    println!("cgm_readings:        {}", stats.cgm_readings);
    println!("basal_deliveries:    {}", stats.basal_deliveries);
    println!("extraction_skips:    {}", stats.extraction_skips);
    Ok(())
}
