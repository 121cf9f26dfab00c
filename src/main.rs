//! CLI entry point for `vme-daq`.
//!
//! ```bash
//! # Replay a raw controller capture through decoding and listfile writing
//! vme-daq replay --config vme_daq.toml --input run042.capture
//!
//! # Summarize a listfile
//! vme-daq inspect listfiles/run_241019_101500.zip
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vme_daq::logging::{self, TracingConfig};
use vme_daq::{inspect_listfile, replay_file, Settings};

#[derive(Parser)]
#[command(name = "vme-daq")]
#[command(about = "VME controller readout into listfiles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a raw controller capture through the readout pipeline
    Replay {
        /// Settings file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Capture file: length-prefixed raw controller buffers
        #[arg(long)]
        input: PathBuf,

        /// Readout cycles to run (default: one per capture record)
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Print a summary of a listfile
    Inspect {
        /// Listfile (.zip or .mvmelst)
        listfile: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            config,
            input,
            cycles,
        } => replay(config, input, cycles),
        Commands::Inspect { listfile } => {
            logging::init(TracingConfig::default()).map_err(anyhow::Error::msg)?;
            let overview = inspect_listfile(&listfile)
                .with_context(|| format!("Failed to read {}", listfile.display()))?;
            println!("{}", listfile.display());
            println!("{}", overview);
            Ok(())
        }
    }
}

fn replay(config: PathBuf, input: PathBuf, cycles: Option<u64>) -> Result<()> {
    let settings = Settings::load(&config)
        .with_context(|| format!("Failed to load settings from {}", config.display()))?;
    let tracing_config = TracingConfig::from_settings(&settings.log_level, settings.log_format)
        .map_err(anyhow::Error::msg)?;
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    let report = replay_file(&settings, &input, cycles)?;
    let stats = &report.summary.stats;
    println!("buffers read:      {}", stats.buffers_read);
    println!("bytes read:        {}", stats.bytes_read);
    println!("events decoded:    {}", stats.events_decoded);
    println!("skipped events:    {}", stats.skipped_events + stats.partial_events);
    println!("buffers w/ errors: {}", stats.buffers_with_errors);
    println!("dropped buffers:   {}", stats.dropped_buffers);
    println!("delivered buffers: {}", report.delivered.buffers);
    if let Some(listfile) = &report.summary.listfile {
        println!(
            "listfile:          {} ({} bytes)",
            listfile.path.display(),
            listfile.bytes_written
        );
    }
    Ok(())
}
