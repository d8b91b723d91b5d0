//! Command-line host for a targeting run.
//!
//! ```text
//! smart_sem --simulation --slots slots.toml --output results
//! ```
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use smart_sem::hardware::{build_microscope, HardwareMode};
use smart_sem::session::{CaptureStage, SessionDirectory};
use smart_sem::slots::ActiveSlots;
use smart_sem::{RunSummary, Settings, TargetingEngine};

/// Exit status for a run stopped with Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(name = "smart_sem", version, about = "Automated SEM particle targeting")]
struct Args {
    /// Use the simulated microscope instead of the vendor link
    #[arg(long)]
    simulation: bool,

    /// TOML configuration file (defaults and SMARTSEM_* overrides apply without one)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Active slots (.json or .toml); a single test sample is used when omitted
    #[arg(long, value_name = "PATH")]
    slots: Option<PathBuf>,

    /// Directory sessions are created under
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Seed for the simulated noise generator
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&settings, args.json_logs);

    match run(args, settings).await {
        Ok(Some(summary)) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("\nInterrupted by user.");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            eprintln!("\n=== Run failed ===");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Settings::load().context("loading configuration")?,
    };
    if let Some(dir) = &args.output {
        settings.application.output_dir = dir.clone();
    }
    if let Some(seed) = args.seed {
        settings.simulation.seed = Some(seed);
    }
    Ok(settings)
}

fn init_logging(settings: &Settings, json: bool) {
    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// `Ok(None)` when interrupted.
async fn run(args: Args, settings: Settings) -> anyhow::Result<Option<RunSummary>> {
    let slots = match &args.slots {
        Some(path) => ActiveSlots::load(path)
            .with_context(|| format!("loading slots from {}", path.display()))?,
        None => {
            tracing::info!("no slot file given, using the built-in test sample");
            ActiveSlots::cli_default()
        }
    };

    let mode = if args.simulation {
        HardwareMode::Simulated
    } else {
        HardwareMode::Real
    };
    tracing::info!(
        app = %settings.application.name,
        ?mode,
        slots = slots.len(),
        "starting targeting run"
    );

    let session = SessionDirectory::create(&settings.application.output_dir)
        .context("creating session directory")?;
    println!("Session directory: {}", session.root().display());

    let microscope = build_microscope(mode, &settings);
    let mut engine = TargetingEngine::new(microscope, Box::new(session), &settings);

    tokio::select! {
        result = engine.run(Some(&slots)) => Ok(Some(result?)),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("run interrupted");
            Ok(None)
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n=== Run completed ===");
    for slot in &summary.slots {
        match (&slot.skipped, &slot.failure) {
            (Some(reason), _) => println!(
                "  slot #{} {}: skipped ({reason:?})",
                slot.slot_id, slot.sample_name
            ),
            (None, Some(error)) => println!(
                "  slot #{} {}: failed: {error}",
                slot.slot_id, slot.sample_name
            ),
            (None, None) => println!(
                "  slot #{} {}: {} particle(s) found, {} imaged",
                slot.slot_id, slot.sample_name, slot.detections_found, slot.targets_visited
            ),
        }
    }
    println!(
        "Frames: {} low-mag, {} high-mag, {} super-high-mag",
        summary.count(CaptureStage::LowMag),
        summary.count(CaptureStage::HighMag),
        summary.count(CaptureStage::SuperHighMag)
    );
}
