//! BMS CAN Logger CLI Application
//!
//! Command-line front end for the bms-can-core pipeline. It adds the
//! process-level concerns the library leaves out:
//! - TOML configuration and command-line overrides
//! - Credential lookup from the environment
//! - Logging setup
//! - Ctrl-C handling

use anyhow::{Context, Result};
use bms_can_core::writer::{Credential, HttpStoreSink};
use bms_can_core::{
    create_source, FrameSource, OperatingMode, Pipeline, PipelineReport, ShutdownSignal, SignalTable,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod config;

use config::{AppConfig, Overrides};

/// BMS CAN Logger - capture battery telemetry from the CAN bus into a time-series store
#[derive(Parser, Debug)]
#[command(name = "bms-can-logger")]
#[command(about = "Capture BMS CAN frames and write them to a time-series store", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture frames and write them to the store until interrupted
    Run {
        /// Path to configuration file (config.toml)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Override [vehicle] car_id
        #[arg(long, value_name = "ID")]
        car_id: Option<String>,

        /// Override [decode] mode (raw, decoded, both)
        #[arg(long, value_name = "MODE")]
        mode: Option<OperatingMode>,

        /// Override the adapter port, interface or replay file
        #[arg(long, value_name = "PORT")]
        port: Option<String>,

        /// Write the final report as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Load a signal table and print its contents
    CheckTable {
        /// Signal table (.toml or .dbc); the built-in Orion layout when omitted
        #[arg(value_name = "FILE")]
        table: Option<PathBuf>,
    },

    /// Print an annotated example configuration
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    match args.command {
        Command::Run {
            config,
            car_id,
            mode,
            port,
            report,
        } => {
            log::info!("BMS CAN Logger v{}", env!("CARGO_PKG_VERSION"));
            log::info!("Using pipeline library v{}", bms_can_core::VERSION);

            let overrides = Overrides {
                car_id,
                mode,
                port,
            };
            run_mode(&config, overrides, report.as_deref()).await
        }
        Command::CheckTable { table } => check_table_mode(table.as_deref()),
        Command::ExampleConfig => {
            print!("{}", config::EXAMPLE_CONFIG);
            Ok(())
        }
    }
}

/// Run mode - capture until Ctrl-C, the source ends, or a fatal adapter error
async fn run_mode(config_path: &Path, overrides: Overrides, report_path: Option<&Path>) -> Result<()> {
    let mut config = config::load_config(config_path)?;
    config.apply_overrides(overrides);
    config.validate().context("Invalid configuration after command-line overrides")?;

    // Fail before touching the adapter if the store cannot be authenticated
    let credential = config.resolve_credential()?;
    let table = config.load_signal_table()?;

    let shutdown = ShutdownSignal::new();
    spawn_interrupt_handler(shutdown.clone());

    // The pipeline and the blocking HTTP client both block; keep them off the async workers
    let report = tokio::task::spawn_blocking(move || run_pipeline(config, credential, table, shutdown))
        .await
        .context("Pipeline task panicked")??;

    log::info!(
        "Finished ({:?}) after {:.1}s: {} records written, {} missing",
        report.end,
        report.elapsed_ms as f64 / 1000.0,
        report.stats.records_written,
        report.stats.records_missing()
    );

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report: {:?}", path))?;
        log::info!("Report written to {:?}", path);
    }

    Ok(())
}

fn run_pipeline(
    config: AppConfig,
    credential: Credential,
    table: Option<SignalTable>,
    shutdown: ShutdownSignal,
) -> Result<PipelineReport> {
    let source = create_source(&config.adapter, &config.bus).context("Failed to configure adapter")?;
    log::info!("Adapter: {}", source.describe());

    let store = config.store.store_config();
    let sink = HttpStoreSink::new(&store, credential).context("Failed to create store client")?;
    log::info!("Store: {} (database {})", store.endpoint, store.database);

    let pipeline = Pipeline::new(config.pipeline_config(), source, table, sink);
    let report = pipeline.run(&shutdown)?;
    Ok(report)
}

/// First Ctrl-C requests a graceful stop; a second one exits immediately
fn spawn_interrupt_handler(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            log::warn!("Unable to listen for Ctrl-C; stop the process with a signal instead");
            return;
        }
        log::info!("Interrupt received, draining buffered records (Ctrl-C again to abort)");
        shutdown.request();

        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Second interrupt, exiting without draining");
            std::process::exit(130);
        }
    });
}

/// Check-table mode - load a table and print what it decodes
fn check_table_mode(path: Option<&Path>) -> Result<()> {
    let table = match path {
        Some(path) => SignalTable::load(path).with_context(|| format!("Failed to load signal table: {:?}", path))?,
        None => SignalTable::orion_telemetry(0x6B0, false)?,
    };

    let stats = table.stats();
    println!("Signal table: {}", table.version());
    println!("  {} signals across {} ids\n", stats.num_signals, stats.num_ids);

    for id in table.arbitration_ids() {
        println!("0x{:X}", id);
        for signal in table.signals_for(id) {
            println!(
                "  {:<24} bits {:>2}+{:<2} {:?} scale={} offset={}{}{}",
                signal.name,
                signal.bit_offset,
                signal.bit_length,
                signal.byte_order,
                signal.scale,
                signal.offset,
                if signal.signed { " signed" } else { "" },
                signal.unit.as_deref().map(|u| format!(" [{}]", u)).unwrap_or_default()
            );
        }
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_overrides_parse() {
        let args = Args::try_parse_from([
            "bms-can-logger",
            "-v",
            "run",
            "--config",
            "config.toml",
            "--car-id",
            "car9",
            "--mode",
            "both",
        ])
        .unwrap();

        assert_eq!(args.verbose, 1);
        match args.command {
            Command::Run { car_id, mode, .. } => {
                assert_eq!(car_id.as_deref(), Some("car9"));
                assert_eq!(mode, Some(OperatingMode::Both));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_check_table_builtin() {
        check_table_mode(None).unwrap();
    }
}
