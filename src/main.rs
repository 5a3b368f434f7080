//! Command-line acquisition with the scope_daq trigger buffer.
//!
//! Loads the configuration, runs the configured backend and logs the channel
//! means of every completed sweep until the requested number of sweeps, Ctrl-C
//! or a device error.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use clap::Parser;
use scope_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use scope_daq::data::capture::run_name;
use scope_daq::data::{BufferEvent, TriggerBuffer};
use scope_daq::engine::{Acquisition, SharedTriggerBuffer};
use scope_daq::logging::init_tracing;
use scope_daq::sweep::SweepAssembler;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Stop after this many sweeps
    #[arg(long)]
    sweeps: Option<u64>,

    /// Capture delivered scans to disk
    #[arg(long)]
    capture: bool,

    /// Directory for capture files
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }
    if let Some(dir) = cli.capture_dir {
        settings.capture.directory = dir;
    }
    settings.capture.enabled |= cli.capture;
    settings.validate()?;

    if cli.print_config {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    init_tracing(&settings.application.log_level, cli.log_json)?;
    info!(
        name = %settings.application.name,
        adapter = %settings.hardware.adapter,
        rate_hz = settings.hardware.acq_rate_hz,
        "starting"
    );

    let capture_name = settings.capture.enabled.then(|| run_name(Local::now()));
    let mut buffer = TriggerBuffer::new(settings).context("Failed to open data source")?;
    buffer.reconfigure()?;
    let channels = buffer.channel_count();
    let mut assembler = SweepAssembler::for_buffer(&buffer);

    let shared = SharedTriggerBuffer::new(buffer);
    let mut events = shared.subscribe();
    let acquisition = Acquisition::start(shared.clone(), capture_name.as_deref())?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BufferEvent::DeviceError(message)) => {
                    error!(%message, "acquisition aborted");
                    break Err(anyhow!("device error: {message}"));
                }
                Ok(event) => {
                    assembler.handle_event(&event);
                    if let Some(sweep) = assembler.drain(&shared)? {
                        let means: Vec<String> = (0..channels)
                            .filter_map(|c| assembler.channel_mean(c))
                            .map(|m| format!("{m:.4}"))
                            .collect();
                        info!(sweep, means = %means.join(" "), "sweep complete");
                        if cli.sweeps.is_some_and(|n| sweep >= n) {
                            break Ok(());
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => break Ok(()),
            },
            _ = &mut ctrl_c => {
                info!("interrupted");
                break Ok(());
            }
        }
    };

    if let Some(rows) = acquisition.stop().await? {
        info!(rows, "capture finished");
    }
    outcome
}
