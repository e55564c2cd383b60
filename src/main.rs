//! CLI Entry Point for tera_daq
//!
//! Runs a THz sweep against the configured instruments (simulated ones when
//! the configuration declares none) and writes the run container under the
//! storage output directory.
//!
//! # Usage
//!
//! Nested temperature × field sweep, 3 repeats per point:
//! ```bash
//! tera_daq run --temperatures 10,20,30 --fields 0,0.5,1 --repeats 3 --operator alice
//! ```
//!
//! Continue an interrupted or failed run:
//! ```bash
//! tera_daq resume data/run_20260101_120000_1a2b3c4d
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use tera_daq::config::DaqConfig;
use tera_daq::data::open_store;
use tera_daq::error::ErrorKind;
use tera_daq::experiment::{
    CaptureTarget, ExperimentState, ReadbackTarget, RunDescription, RunRequest, RunnerHandle,
    StatusSnapshot, SweepAxis, SweepConfig,
};
use tera_daq::hardware::registry::build_dispatcher;
use tera_daq::tracing_setup;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "tera_daq")]
#[command(about = "Resumable THz sweep execution", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/tera_daq.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the storage output directory
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a new sweep
    Run {
        /// Temperature setpoints in K
        #[arg(long, value_delimiter = ',', required = true)]
        temperatures: Vec<f64>,

        /// Magnetic field setpoints in T
        #[arg(long, value_delimiter = ',')]
        fields: Vec<f64>,

        /// Repeats per point
        #[arg(long, default_value_t = 1)]
        repeats: usize,

        /// Step temperature and field together instead of nesting
        #[arg(long)]
        zipped: bool,

        /// Dwell time after setting the axes, in milliseconds
        #[arg(long, default_value_t = 0)]
        dwell_ms: u64,

        /// Operator name recorded in the run metadata
        #[arg(long, default_value = "")]
        operator: String,

        /// Free-text description recorded in the run metadata
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Continue a persisted run
    Resume {
        /// Run container (directory or file)
        location: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaqConfig::load_from(path),
        None => DaqConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(output) = cli.output {
        config.storage.output_dir = output;
    }
    tracing_setup::init_from_config(&config)?;

    let dispatcher = build_dispatcher(&config)?;
    let store = open_store(&config.storage)?;
    let runner = RunnerHandle::spawn(dispatcher, store, &config.runner)?;

    let progress = tokio::spawn(log_progress(runner.status_stream()));

    let run_id = match cli.command {
        Commands::Run {
            temperatures,
            fields,
            repeats,
            zipped,
            dwell_ms,
            operator,
            description,
        } => {
            let sweep = build_sweep(temperatures, fields, repeats, zipped, dwell_ms)?;
            let request = RunRequest::new(sweep).with_description(RunDescription {
                operator,
                description,
                ..Default::default()
            });
            runner.start_with(request).await?
        }
        Commands::Resume { location } => runner
            .continue_from(&location)
            .await
            .with_context(|| format!("Cannot continue run at {}", location.display()))?,
    };
    info!(run_id = %run_id, "Run started");

    let last = tokio::select! {
        snapshot = runner.wait_until(is_finished) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            let state = runner.latest().state;
            if interruptible(state) {
                warn!(run_id = %run_id, "Interrupted, stopping run");
                match runner.stop().await {
                    Ok(()) => {}
                    // Finished between the check and the stop
                    Err(e) if e.kind() == ErrorKind::Rejected => {
                        warn!(run_id = %run_id, error = %e, "Run already finished")
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                warn!(run_id = %run_id, state = %state, "Interrupted");
            }
            runner.latest()
        }
    };

    runner.shutdown().await?;
    progress.abort();

    match (last.state, &last.last_error) {
        (ExperimentState::Error, Some(report)) => {
            bail!("Run {} failed: {}", run_id, report)
        }
        (ExperimentState::Error, None) => bail!("Run {} failed", run_id),
        _ => {
            info!(
                run_id = %run_id,
                state = %last.state,
                completed = last.completed_points,
                total = last.total_points,
                "Run finished"
            );
            Ok(())
        }
    }
}

fn is_finished(snapshot: &StatusSnapshot) -> bool {
    snapshot.run_id.is_some()
        && matches!(
            snapshot.state,
            ExperimentState::Completed | ExperimentState::Error | ExperimentState::Idle
        )
}

/// A run Ctrl-C should stop: one that is running or paused.
fn interruptible(state: ExperimentState) -> bool {
    state.can_pause() || state.can_resume()
}

fn build_sweep(
    temperatures: Vec<f64>,
    fields: Vec<f64>,
    repeats: usize,
    zipped: bool,
    dwell_ms: u64,
) -> Result<SweepConfig> {
    let mut axes = vec![SweepAxis::new("temperature", "K", temperatures)
        .targeting("temperature-control", "temperature")
        .wait_for_stable(true)];
    if !fields.is_empty() {
        axes.push(
            SweepAxis::new("field", "T", fields)
                .targeting("field-control", "field")
                .wait_for_stable(true),
        );
    }

    let sweep = if zipped {
        if repeats > 1 {
            bail!("--repeats cannot be combined with --zipped");
        }
        SweepConfig::zipped(axes)?
    } else {
        if repeats > 1 {
            axes.push(SweepAxis::count(repeats));
        }
        SweepConfig::nested(axes)?
    };

    Ok(sweep
        .with_dwell(Duration::from_millis(dwell_ms))
        .with_readback(ReadbackTarget::new(
            "temperature-control",
            "temperature",
            "temperature_readback",
        ))
        .with_capture(CaptureTarget::new("thz", "source")))
}

async fn log_progress(mut stream: impl futures::Stream<Item = StatusSnapshot> + Unpin) {
    while let Some(snapshot) = stream.next().await {
        if let (Some(index), Some(coordinate)) = (snapshot.index, &snapshot.coordinate) {
            info!(
                index,
                coordinate = ?coordinate,
                progress = format!("{:.1}%", snapshot.progress() * 100.0),
                "Point complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_live_runs_are_stopped_on_interrupt() {
        assert!(interruptible(ExperimentState::Running));
        assert!(interruptible(ExperimentState::Paused));
        assert!(!interruptible(ExperimentState::Error));
        assert!(!interruptible(ExperimentState::Completed));
        assert!(!interruptible(ExperimentState::Idle));
    }

    #[test]
    fn repeats_nest_a_count_axis() {
        let sweep = build_sweep(vec![10.0, 20.0], vec![0.0, 1.0], 3, false, 0).unwrap();
        assert_eq!(sweep.axis_names(), vec!["temperature", "field", "count"]);
        assert!(build_sweep(vec![10.0], vec![0.0], 2, true, 0).is_err());
    }
}
