//! geomon - geothermal metric monitoring and 4-20 mA calibration
//!
//! Operator entry point: feeds samples into the file-backed store, queries
//! anomaly counts and window statistics, and evaluates calibration channels.
//! Results are printed to stdout as JSON; logs go to stderr.

#![forbid(unsafe_code)]

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use geomon_core::calibration::evaluate;
use geomon_core::{
    CalibrationChannel, Clock, Config, MetricSample, Status, SystemClock, global_metrics,
    signal_percent,
};
use geomon_monitor::{EngineOptions, MonitorHub};
use geomon_storage::{FileStore, Store};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "geomon")]
#[command(
    version,
    about = "Geothermal metric monitoring, anomaly tracking and 4-20 mA calibration",
    after_help = "Storage and thresholds are configured through GEOMON_* environment variables \
                  (or a .env file in the working directory)."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Commands {
    /// Classify, track and record one sample.
    ///
    /// Each invocation starts from a normal status, so an anomalous value is
    /// always logged as a new event. Use `ingest` for continuous streams.
    Observe {
        metric: String,
        value: f64,
        /// Sample time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Read `<metric> <value> [timestamp]` lines from stdin and print the
    /// final snapshot of every metric seen.
    Ingest,

    /// Print anomaly counts for the 12h/24h/7d windows.
    Counts { metric: String },

    /// Print min/max/avg for the 12h/24h/7d windows.
    Stats { metric: String },

    /// Delete a metric's anomaly and sample histories.
    Reset { metric: String },

    /// Convert a process value to an output current.
    Calibrate {
        value: f64,
        /// Channel configuration (JSON); defaults to a 0-100 to 4-20 mA channel
        #[arg(long)]
        channel: Option<PathBuf>,
    },

    /// Print the engine counters of this process.
    Metrics,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ObserveReport {
    metric: String,
    value: f64,
    status: Status,
    edge: bool,
    persisted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ideal: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CalibrationReport {
    process_value: f64,
    output_ma: f64,
    signal_percent: f64,
    mode: &'static str,
    issues: Vec<String>,
}

fn open_store(config: &Config) -> CliResult<Arc<dyn Store>> {
    let store = FileStore::open(&config.storage_root)?.with_lock_timeout(config.store_lock_timeout);
    Ok(Arc::new(store))
}

/// Hub without background workers, for one-shot commands.
fn oneshot_hub(config: &Config, clock: Arc<dyn Clock>) -> CliResult<MonitorHub> {
    Ok(MonitorHub::new(
        open_store(config)?,
        clock,
        config.threshold_catalog()?,
        EngineOptions::from_config(config),
    ))
}

fn print_json<T: Serialize>(out: &mut impl Write, value: &T) -> CliResult {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Parse one ingest line: `<metric> <value> [timestamp]`. Metric names may
/// contain spaces. Blank lines and `#` comments yield `None`.
fn parse_sample_line(line: &str, now: DateTime<Utc>) -> Result<Option<MetricSample>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (timestamp, rest) = match tokens.split_last() {
        Some((last, rest)) if rest.len() >= 2 => match last.parse::<DateTime<Utc>>() {
            Ok(ts) => (ts, rest),
            Err(_) => (now, tokens.as_slice()),
        },
        _ => (now, tokens.as_slice()),
    };
    let Some((raw_value, metric)) = rest.split_last() else {
        return Err(format!("expected '<metric> <value> [timestamp]', got {line:?}"));
    };
    if metric.is_empty() {
        return Err(format!("missing metric name in {line:?}"));
    }
    let value: f64 = raw_value
        .parse()
        .map_err(|_| format!("invalid value {raw_value:?} in {line:?}"))?;
    Ok(Some(MetricSample::new(metric.join(" "), value, timestamp)))
}

fn run(
    command: Commands,
    config: &Config,
    clock: Arc<dyn Clock>,
    input: impl BufRead,
    out: &mut impl Write,
) -> CliResult {
    match command {
        Commands::Observe { metric, value, at } => {
            let hub = oneshot_hub(config, Arc::clone(&clock))?;
            let monitor = hub.monitor(&metric)?;
            let observation = monitor.ingest(value, at.unwrap_or_else(|| clock.now()));
            let report = ObserveReport {
                metric: monitor.metric_key().to_string(),
                value,
                status: observation.status,
                edge: observation.edge,
                persisted: observation.persisted,
                ideal: hub.catalog().get(&metric).map(|t| t.is_ideal(value)),
            };
            print_json(out, &report)
        }
        Commands::Ingest => {
            let hub = MonitorHub::from_config(config, open_store(config)?, Arc::clone(&clock))?;
            let mut accepted = 0usize;
            for (lineno, line) in input.lines().enumerate() {
                let line = line?;
                match parse_sample_line(&line, clock.now()) {
                    Ok(Some(sample)) => {
                        hub.ingest(&sample)?;
                        accepted += 1;
                    }
                    Ok(None) => {}
                    Err(reason) => {
                        tracing::warn!(line = lineno + 1, %reason, "skipping input line");
                    }
                }
            }
            tracing::info!(samples = accepted, metrics = hub.keys().len(), "ingest finished");
            let keys = hub.keys();
            hub.shutdown();
            let hub = oneshot_hub(config, clock)?;
            let snapshots: Vec<_> = keys
                .iter()
                .map(|key| hub.monitor(key).map(|m| m.snapshot()))
                .collect::<Result<_, _>>()?;
            print_json(out, &snapshots)
        }
        Commands::Counts { metric } => {
            let hub = oneshot_hub(config, clock)?;
            let counts = hub.monitor(&metric)?.refresh_counts();
            print_json(out, &counts)
        }
        Commands::Stats { metric } => {
            let hub = oneshot_hub(config, clock)?;
            let stats = hub.monitor(&metric)?.refresh_stats();
            print_json(out, &stats)
        }
        Commands::Reset { metric } => {
            let hub = oneshot_hub(config, clock)?;
            let monitor = hub.monitor(&metric)?;
            monitor.reset()?;
            print_json(out, &monitor.snapshot())
        }
        Commands::Calibrate { value, channel } => {
            let channel: CalibrationChannel = match channel {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => CalibrationChannel::default(),
            };
            let (output_ma, mode) = evaluate(value, &channel);
            let report = CalibrationReport {
                process_value: value,
                output_ma,
                signal_percent: signal_percent(output_ma),
                mode: mode.label(),
                issues: channel.validate().iter().map(ToString::to_string).collect(),
            };
            print_json(out, &report)
        }
        Commands::Metrics => print_json(out, &global_metrics().snapshot()),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    if cli.verbose {
        tracing::debug!("Configuration loaded: {:?}", config);
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();
    match run(cli.command, &config, Arc::new(SystemClock), stdin.lock(), &mut stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("command failed: {err}");
            ExitCode::FAILURE
        }
    }
}
