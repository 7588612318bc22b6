//! CLI Entry Point for daq-tune
//!
//! Runs the orchestration core against simulated hardware:
//! - `tune`: multi-pass tune of a mock stage against a Gaussian-peak detector
//! - `scan`: a monitored hardware-run scan of a mock scan record
//!
//! Reports are printed to stdout as JSON; logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! daq-tune tune --center 0.3 --start 0.0
//! daq-tune scan --points 20 --stall-after 5 --config config/daq_tune.toml
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_tune::config::{TuneConfig, DEFAULT_CONFIG_PATH};
use daq_tune::documents::DocumentRecorder;
use daq_tune::hardware::mock::{MockPeakDetector, MockScanRecord, MockStage};
use daq_tune::hardware::{DeviceRef, Detector, Movable};
use daq_tune::logging::{self, OutputFormat, TracingConfig};
use daq_tune::scan::ScanMonitor;
use daq_tune::tuner::{tune_axes, MultiPassOptions, TunableAxis, TuneAxis};
use tracing::info;

#[derive(Parser)]
#[command(name = "daq-tune")]
#[command(about = "Asynchronous scan and axis-tune orchestration", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Multi-pass tune of a simulated stage
    Tune {
        /// Peak position of the simulated detector
        #[arg(long, default_value = "0.25")]
        center: f64,

        /// Peak width (sigma) of the simulated detector
        #[arg(long, default_value = "0.1")]
        sigma: f64,

        /// Starting stage position
        #[arg(long, default_value = "0.0")]
        start: f64,

        /// Print every emitted document, not just the pass history
        #[arg(long)]
        documents: bool,
    },

    /// Monitor a simulated hardware-run scan
    Scan {
        /// Number of points in the scan
        #[arg(long, default_value = "10")]
        points: usize,

        /// Milliseconds between points
        #[arg(long, default_value = "20")]
        interval_ms: u64,

        /// Go silent before this row to exercise stall detection
        #[arg(long)]
        stall_after: Option<usize>,

        /// Print every emitted document, not just the outcome
        #[arg(long)]
        documents: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TuneConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let format: OutputFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    logging::init(TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?.with_format(format))
        .map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, "starting");

    match cli.command {
        Commands::Tune {
            center,
            sigma,
            start,
            documents,
        } => run_tune(&config, center, sigma, start, documents).await,
        Commands::Scan {
            points,
            interval_ms,
            stall_after,
            documents,
        } => run_scan(&config, points, interval_ms, stall_after, documents).await,
    }
}

async fn run_tune(
    config: &TuneConfig,
    center: f64,
    sigma: f64,
    start: f64,
    show_documents: bool,
) -> Result<()> {
    let stage = Arc::new(
        MockStage::with_position(start)
            .speed(100.0)
            .settle_time(Duration::from_millis(5)),
    );
    let detector = Arc::new(MockPeakDetector::gaussian(stage.clone(), center, sigma, 1e4));

    let tuner = TuneAxis::new(
        DeviceRef::new("m1", stage.clone() as Arc<dyn Movable>),
        vec![DeviceRef::new("I0", detector as Arc<dyn Detector>)],
    )
    .configure(&config.tuner)?;
    let mut axes = vec![TunableAxis::new(DeviceRef::new("m1", stage as Arc<dyn Movable>))
        .with_tuner(tuner)
        .with_options(MultiPassOptions::from(&config.tuner))];

    let recorder = DocumentRecorder::default();
    let reports = tune_axes(&mut axes, &recorder).await?;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    if show_documents {
        println!("{}", serde_json::to_string_pretty(&recorder.documents())?);
    }
    Ok(())
}

async fn run_scan(
    config: &TuneConfig,
    points: usize,
    interval_ms: u64,
    stall_after: Option<usize>,
    show_documents: bool,
) -> Result<()> {
    let mut record = MockScanRecord::linear(
        "scan1",
        -1.0,
        1.0,
        points,
        Duration::from_millis(interval_ms),
    );
    if let Some(index) = stall_after {
        record = record.stall_after(index);
    }

    let monitor = ScanMonitor::new(config.scan.monitor_config())?;
    let recorder = DocumentRecorder::default();
    let mut metadata = BTreeMap::new();
    metadata.insert("purpose".to_string(), serde_json::json!("demo"));

    let outcome = monitor.run(&record, &recorder, &metadata).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if show_documents {
        println!("{}", serde_json::to_string_pretty(&recorder.documents())?);
    }
    Ok(())
}
