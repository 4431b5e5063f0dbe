//! AQUEDUCT co-simulation CLI.
//!
//! Runs a configured water-plant scenario: the physical process driver,
//! the PLC fleet, or both, against a shared durable tag store.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use aqueduct_core::{Plc, StorePeerReader};
use aqueduct_sim::{scenario, PhysicalPlant, SimError, SimulationConfig};
use aqueduct_store::{SledTagStore, TagStore};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Water-distribution plant co-simulation
#[derive(Parser, Debug)]
#[command(name = "aqueduct-sim")]
#[command(about = "Run a water-distribution ICS co-simulation", long_about = None)]
struct Args {
    /// Path to the YAML simulation configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Component to run (all, driver, plc)
    #[arg(short, long, default_value = "all")]
    mode: String,

    /// Controller name (required with --mode plc)
    #[arg(long)]
    plc: Option<String>,

    /// Week scenario override
    #[arg(short, long)]
    week: Option<usize>,

    /// Deterministic single-thread interleaving instead of free-running
    /// threads (mode "all" only)
    #[arg(long)]
    lockstep: bool,

    /// Directory for controller state snapshots
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), SimError> {
    let mut cfg = SimulationConfig::load(&args.config)?;
    if let Some(week) = args.week {
        cfg.week_index = week;
    }

    // graceful shutdown: stop taking iterations, flush, exit
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;

    let store: Arc<dyn TagStore> = Arc::new(SledTagStore::open(&cfg.db_path)?);

    match args.mode.as_str() {
        "all" => {
            if args.lockstep {
                let report = scenario::run_lockstep(&cfg, store)?;
                info!(
                    iterations = report.iterations,
                    rows = report.rows_written,
                    "lockstep run complete"
                );
            } else {
                let outcome =
                    scenario::run_threaded(&cfg, store, shutdown, args.state_dir.as_deref())?;
                if !outcome.plc_failures.is_empty() {
                    for (name, reason) in &outcome.plc_failures {
                        error!(plc = %name, reason = %reason, "controller failed during the run");
                    }
                    std::process::exit(1);
                }
            }
        }
        "driver" => {
            let model = scenario::build_model(&cfg)?;
            let driver_cfg = scenario::driver_config(&cfg, &model)?;
            let mut plant = PhysicalPlant::new(model, store, driver_cfg, shutdown)?;
            let report = plant.run()?;
            info!(
                iterations = report.iterations,
                barrier_timeouts = report.barrier_timeouts,
                rows = report.rows_written,
                "driver finished"
            );
        }
        "plc" => {
            let name = args.plc.ok_or_else(|| {
                SimError::InvalidConfiguration("--plc <name> is required with --mode plc".into())
            })?;
            let spec = cfg
                .plcs
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| {
                    SimError::InvalidConfiguration(format!("no PLC named {name:?} in the config"))
                })?
                .clone();
            let attack = cfg.attack_descriptor()?;
            let reader = Arc::new(StorePeerReader::new(cfg.peer_registry(), store.clone()));
            let mut plc = Plc::new(
                spec,
                store,
                reader,
                attack,
                shutdown,
                args.state_dir.as_deref(),
            )
            .map_err(SimError::Plc)?;
            plc.run().map_err(SimError::Plc)?;
        }
        other => {
            return Err(SimError::InvalidConfiguration(format!(
                "unknown mode {other:?} (expected all, driver or plc)"
            )))
        }
    }
    Ok(())
}
