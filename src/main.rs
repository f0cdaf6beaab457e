//! CLI entry point for scanlog.
//!
//! # Usage
//!
//! Log scans from the auto-detected scanner into today's file:
//! ```bash
//! scanlog run
//! ```
//!
//! Use a specific port and config file:
//! ```bash
//! scanlog run --port /dev/ttyACM0 --config config/scanlog.toml
//! ```
//!
//! Print a day's log, or list serial ports:
//! ```bash
//! scanlog show --date 20230327
//! scanlog ports
//! ```

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use scanlog::config::AppConfig;
use scanlog::data::{scan_file, Record, RecordStore};
use scanlog::discovery::{find_scanner_port, list_ports};
use scanlog::framing::FramingError;
use scanlog::ingest::{spawn_observer, IngestObserver, IngestionController, StopReason};
use scanlog::logging;
use scanlog::serial::open_serial_async;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "scanlog")]
#[command(about = "Log barcode scans from a serial scanner, skipping duplicates", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest scans until Ctrl+C or the scanner disconnects
    Run {
        /// Config file (defaults to config/scanlog.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Serial port to open instead of auto-detecting one
        #[arg(long)]
        port: Option<String>,
    },

    /// Print the records stored for a day
    Show {
        /// Config file (defaults to config/scanlog.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Day to show as YYYYMMDD (defaults to today)
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
    },

    /// List serial ports and whether they look like a scanner
    Ports {
        /// Config file (defaults to config/scanlog.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y%m%d").map_err(|e| format!("expected YYYYMMDD: {e}"))
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, port } => run(config, port).await,
        Commands::Show { config, date } => show(config, date),
        Commands::Ports { config } => ports(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let config = AppConfig::load_validated(path.as_deref())?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    Ok(config)
}

async fn run(config_path: Option<PathBuf>, port: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;

    let port = match port.or_else(|| config.serial.port.clone()) {
        Some(port) => port,
        None => find_scanner_port(&config.serial.match_keywords)
            .context("No scanner found; pass --port or set serial.port")?,
    };

    let store = RecordStore::open_for_day(&config.log_layout(), today())?;
    let log_path = store.path().to_path_buf();
    let controller = IngestionController::new(store, config.ingest_settings()?)?;
    let stored = controller.dedup_index().len();

    let link = open_serial_async(&port, config.serial.baud_rate, "scanner").await?;

    let observer = spawn_observer(controller.subscribe(), ConsoleObserver::default());
    let handle = controller.start(link);

    println!("Reading from {port}");
    println!("Logging to {} ({stored} records already stored)", log_path.display());
    println!("Press Ctrl+C to stop");

    let stopper = handle.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            stopper.stop();
        }
    });

    let result = handle.wait().await;
    let console = observer.await.context("observer task failed")?;
    let summary = result?;

    println!(
        "Stored {} new, {} duplicates, {} discarded frames",
        summary.accepted, summary.duplicates, summary.framing_errors
    );
    if summary.stop_reason == StopReason::Disconnected {
        anyhow::bail!(
            "scanner disconnected: {}",
            console.fatal.as_deref().unwrap_or("link closed")
        );
    }
    Ok(())
}

fn show(config_path: Option<PathBuf>, date: Option<NaiveDate>) -> Result<()> {
    let config = load_config(config_path)?;
    let path = config.log_layout().path_for(date.unwrap_or_else(today));

    let outcome = scan_file(&path)?;
    if outcome.skipped > 0 {
        warn!(skipped = outcome.skipped, "Some rows could not be read");
    }
    if outcome.records.is_empty() {
        println!("No records in {}", path.display());
        return Ok(());
    }
    for record in &outcome.records {
        println!("{record}");
    }
    Ok(())
}

fn ports(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let candidates = list_ports()?;
    if candidates.is_empty() {
        println!("No serial ports found");
    }
    for candidate in candidates {
        let marker = if candidate.matches(&config.serial.match_keywords) {
            "*"
        } else {
            " "
        };
        println!("{marker} {}  {}", candidate.port_name, candidate.description);
    }
    Ok(())
}

/// Prints ingestion events for the operator.
#[derive(Default)]
struct ConsoleObserver {
    fatal: Option<String>,
}

impl IngestObserver for ConsoleObserver {
    fn on_accepted(&mut self, record: &Record) {
        println!("{record}");
    }

    fn on_duplicate(&mut self, payload: &str) {
        println!("{payload} already stored");
    }

    fn on_framing_error(&mut self, error: &FramingError) {
        eprintln!("Discarded input: {error}");
    }

    fn on_fatal_error(&mut self, reason: &str) {
        eprintln!("Ingestion stopped: {reason}");
        self.fatal = Some(reason.to_string());
    }
}
