//! Scenario assembly: wire a store, the driver and the controller fleet
//! together and run them to completion.
//!
//! Two execution modes share the same components:
//!
//! - **threaded** - the deployment shape: driver and controllers run as
//!   independently scheduled loops with no shared memory beyond the
//!   injected store handle, exactly as they would as separate processes.
//! - **lockstep** - a deterministic interleaving (every controller cycles
//!   once, then the driver steps) used by the end-to-end tests, where
//!   iteration-exact assertions about attack windows must hold.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aqueduct_core::barrier::BarrierConfig;
use aqueduct_core::{Plc, StorePeerReader};
use aqueduct_store::TagStore;
use tracing::{error, info};

use crate::config::SimulationConfig;
use crate::driver::{DriverConfig, DriverReport, PhysicalPlant};
use crate::model::{HydraulicModel, TankNetwork};
use crate::tables::CsvTable;
use crate::SimError;

/// What a finished run looked like.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub report: DriverReport,
    /// Controllers that exited abnormally: (name, error).
    pub plc_failures: Vec<(String, String)>,
}

/// Builds the hydraulic model from the configuration, applying the week
/// scenario (demand patterns, initial tank levels) when requested.
pub fn build_model(cfg: &SimulationConfig) -> Result<TankNetwork, SimError> {
    let demand_model = cfg.demand_model()?;
    let seed = (cfg.week_index as u64).wrapping_mul(0x9e3779b97f4a7c15);
    let mut model = TankNetwork::load(&cfg.inp_file, demand_model, seed)?;
    if cfg.initial_custom_flag {
        apply_week_scenario(cfg, &mut model)?;
        info!(week_index = cfg.week_index, "week scenario applied");
    }
    Ok(model)
}

fn apply_week_scenario(cfg: &SimulationConfig, model: &mut TankNetwork) -> Result<(), SimError> {
    let table = |path: &Option<std::path::PathBuf>, what: &str| {
        path.as_ref()
            .ok_or_else(|| SimError::InvalidConfiguration(format!("{what} missing")))
            .and_then(|p| CsvTable::load(p))
    };
    let demands = table(&cfg.demand_patterns_path, "demand_patterns_path")?;
    let starts = table(&cfg.starting_demand_path, "starting_demand_path")?;
    let inits = table(&cfg.initial_tank_levels_path, "initial_tank_levels_path")?;

    let week_start = starts.value_at(cfg.week_index, 0).ok_or_else(|| {
        SimError::InvalidConfiguration(format!(
            "week_index {} out of range of the starting-demand table",
            cfg.week_index
        ))
    })? as usize;
    let hours = (cfg.duration_days * 24) as usize;

    for pattern in model.pattern_names() {
        let multipliers = demands
            .column_slice(&pattern, week_start, hours)
            .ok_or_else(|| {
                SimError::InvalidConfiguration(format!(
                    "demand pattern table has no usable column {pattern:?} at offset {week_start}"
                ))
            })?;
        model.set_pattern(&pattern, multipliers);
    }
    for tank in model.tank_names().to_vec() {
        if inits.has_column(&tank) {
            let level = inits.value(cfg.week_index, &tank).ok_or_else(|| {
                SimError::InvalidConfiguration(format!(
                    "week_index {} out of range of the initial-tank-level table",
                    cfg.week_index
                ))
            })?;
            model.set_initial_level(&tank, level);
        }
    }
    Ok(())
}

/// Resolves the driver parameters from the configuration and the model's
/// hydraulic timestep.
pub fn driver_config(
    cfg: &SimulationConfig,
    model: &TankNetwork,
) -> Result<DriverConfig, SimError> {
    let derived = cfg.duration_days * 24 * 3600 / model.timestep_secs().max(1);
    Ok(DriverConfig {
        iteration_limit: cfg.iteration_limit.unwrap_or(derived),
        barrier: BarrierConfig {
            full_mask: cfg.full_mask(),
            poll_interval: Duration::from_millis(cfg.barrier_poll_ms),
            max_polls: cfg.barrier_retries,
        },
        store_retries: cfg.store_retries,
        retry_interval: Duration::from_millis(cfg.barrier_poll_ms),
        attack: cfg.attack_descriptor()?,
        output_path: cfg.output_ground_truth_path.clone(),
    })
}

fn build_plcs(
    cfg: &SimulationConfig,
    store: Arc<dyn TagStore>,
    shutdown: Arc<AtomicBool>,
    state_dir: Option<&Path>,
) -> Result<Vec<Plc>, SimError> {
    let attack = cfg.attack_descriptor()?;
    let registry = cfg.peer_registry();
    cfg.plcs
        .iter()
        .map(|spec| {
            let reader = Arc::new(StorePeerReader::new(registry.clone(), store.clone()));
            Plc::new(
                spec.clone(),
                store.clone(),
                reader,
                attack.clone(),
                shutdown.clone(),
                state_dir,
            )
            .map_err(SimError::Plc)
        })
        .collect()
}

/// Free-running mode: the driver and every controller on their own
/// threads, cadenced only by the barrier protocol.
pub fn run_threaded(
    cfg: &SimulationConfig,
    store: Arc<dyn TagStore>,
    shutdown: Arc<AtomicBool>,
    state_dir: Option<&Path>,
) -> Result<ScenarioOutcome, SimError> {
    let model = build_model(cfg)?;
    let driver_cfg = driver_config(cfg, &model)?;
    // the driver seeds the store before any controller starts
    let mut plant = PhysicalPlant::new(model, store.clone(), driver_cfg, shutdown.clone())?;
    let plcs = build_plcs(cfg, store, shutdown.clone(), state_dir)?;

    let mut handles = Vec::new();
    for mut plc in plcs {
        let name = plc.name().to_string();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || plc.run())?;
        handles.push((name, handle));
    }

    let result = plant.run();

    // stop the fleet whatever happened to the driver
    shutdown.store(true, Ordering::Relaxed);
    let mut plc_failures = Vec::new();
    for (name, handle) in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(plc = %name, error = %e, "controller exited abnormally");
                plc_failures.push((name, e.to_string()));
            }
            Err(_) => {
                error!(plc = %name, "controller thread panicked");
                plc_failures.push((name, "panicked".to_string()));
            }
        }
    }

    let report = result?;
    info!(
        iterations = report.iterations,
        barrier_timeouts = report.barrier_timeouts,
        rows = report.rows_written,
        "scenario complete"
    );
    Ok(ScenarioOutcome {
        report,
        plc_failures,
    })
}

/// Deterministic mode: every controller cycles exactly once per driver
/// iteration, in configuration order, on the calling thread.
pub fn run_lockstep(
    cfg: &SimulationConfig,
    store: Arc<dyn TagStore>,
) -> Result<DriverReport, SimError> {
    let model = build_model(cfg)?;
    let driver_cfg = driver_config(cfg, &model)?;
    let limit = driver_cfg.iteration_limit;
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut plant = PhysicalPlant::new(model, store.clone(), driver_cfg, shutdown.clone())?;
    let mut plcs = build_plcs(cfg, store, shutdown, None)?;

    while plant.master_time() < limit {
        for plc in plcs.iter_mut() {
            plc.cycle().map_err(SimError::Plc)?;
        }
        if let Err(e) = plant.step() {
            error!(error = %e, "fatal error in lockstep run, flushing partial results");
            if let Err(flush_err) = plant.finalize() {
                error!(error = %flush_err, "partial-results flush failed");
            }
            return Err(e);
        }
    }
    plant.finalize()?;
    Ok(plant.report().clone())
}
