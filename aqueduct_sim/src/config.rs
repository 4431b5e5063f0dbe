//! Simulation configuration.
//!
//! One YAML file describes a whole run: the plant inputs, the shared
//! store path, the output artifact, the attack selection and the
//! controller fleet. Validation is strict and happens before anything is
//! built - a bad configuration exits non-zero without a partial run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use aqueduct_core::attack::{self, AttackDescriptor};
use aqueduct_core::{PeerRegistry, PlcSpec};
use serde::Deserialize;

use crate::model::DemandModel;
use crate::SimError;

fn default_barrier_poll_ms() -> u64 {
    50
}

fn default_barrier_retries() -> u32 {
    200
}

fn default_store_retries() -> u32 {
    3
}

/// Top-level run description, loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Network description consumed by the hydraulic model.
    pub inp_file: PathBuf,
    /// Durable tag store location shared by every component.
    pub db_path: PathBuf,
    /// Where the ground-truth CSV is written at shutdown.
    pub output_ground_truth_path: PathBuf,
    /// Run length; the iteration limit is derived from this and the
    /// hydraulic timestep unless `iteration_limit` overrides it.
    pub duration_days: u64,
    /// Demand model: `pdd` or `dd`. Anything else is fatal.
    pub simulator: String,
    #[serde(default)]
    pub week_index: usize,
    /// When set, demand patterns and initial tank levels are loaded from
    /// the three CSV tables below, selected by `week_index`.
    #[serde(default)]
    pub initial_custom_flag: bool,
    #[serde(default)]
    pub demand_patterns_path: Option<PathBuf>,
    #[serde(default)]
    pub starting_demand_path: Option<PathBuf>,
    #[serde(default)]
    pub initial_tank_levels_path: Option<PathBuf>,
    #[serde(default)]
    pub run_attack: bool,
    #[serde(default)]
    pub attack_path: Option<PathBuf>,
    #[serde(default)]
    pub attack_name: Option<String>,
    /// Short-run override for the derived iteration limit.
    #[serde(default)]
    pub iteration_limit: Option<u64>,
    /// Barrier poll interval, milliseconds.
    #[serde(default = "default_barrier_poll_ms")]
    pub barrier_poll_ms: u64,
    /// Barrier poll budget per iteration.
    #[serde(default = "default_barrier_retries")]
    pub barrier_retries: u32,
    /// Bounded retry budget for driver store reads/writes.
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    /// Controller fleet.
    #[serde(default)]
    pub plcs: Vec<PlcSpec>,
    /// Peer name → network address map for cross-controller reads.
    #[serde(default)]
    pub peers: HashMap<String, String>,
}

impl SimulationConfig {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SimError::InvalidConfiguration(format!("cannot read config {}: {e}", path.display()))
        })?;
        let cfg: Self = serde_yaml::from_str(&raw).map_err(|e| {
            SimError::InvalidConfiguration(format!("malformed config {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses the demand model string; unknown values are fatal.
    pub fn demand_model(&self) -> Result<DemandModel, SimError> {
        match self.simulator.as_str() {
            "pdd" => Ok(DemandModel::Pdd),
            "dd" => Ok(DemandModel::Dd),
            other => Err(SimError::InvalidConfiguration(format!(
                "unknown simulator mode {other:?} (expected \"pdd\" or \"dd\")"
            ))),
        }
    }

    /// OR of every controller's mask bit.
    pub fn full_mask(&self) -> i64 {
        self.plcs.iter().fold(0, |acc, p| acc | p.mask_bit)
    }

    /// The attack descriptor selected by name, if the run carries one.
    pub fn attack_descriptor(&self) -> Result<Option<AttackDescriptor>, SimError> {
        if !self.run_attack {
            return Ok(None);
        }
        let path = self.attack_path.as_ref().ok_or_else(|| {
            SimError::InvalidConfiguration("run_attack set but attack_path missing".to_string())
        })?;
        let name = self.attack_name.as_ref().ok_or_else(|| {
            SimError::InvalidConfiguration("run_attack set but attack_name missing".to_string())
        })?;
        attack::load_descriptor(path, name)
            .map(Some)
            .map_err(|e| SimError::InvalidConfiguration(e.to_string()))
    }

    pub fn peer_registry(&self) -> PeerRegistry {
        PeerRegistry::new(self.peers.clone())
    }

    fn validate(&self) -> Result<(), SimError> {
        self.demand_model()?;

        let mut names = HashSet::new();
        let mut owned = HashSet::new();
        let mut mask = 0i64;
        for plc in &self.plcs {
            if !names.insert(plc.name.clone()) {
                return Err(SimError::InvalidConfiguration(format!(
                    "duplicate PLC name {:?}",
                    plc.name
                )));
            }
            if plc.mask_bit <= 0 || plc.mask_bit.count_ones() != 1 {
                return Err(SimError::InvalidConfiguration(format!(
                    "PLC {:?} mask_bit {} is not a single bit",
                    plc.name, plc.mask_bit
                )));
            }
            if mask & plc.mask_bit != 0 {
                return Err(SimError::InvalidConfiguration(format!(
                    "PLC {:?} mask_bit {} overlaps another controller",
                    plc.name, plc.mask_bit
                )));
            }
            mask |= plc.mask_bit;
            for rule in &plc.rules {
                if !owned.insert(rule.actuator.clone()) {
                    return Err(SimError::InvalidConfiguration(format!(
                        "actuator {:?} is owned by more than one controller",
                        rule.actuator
                    )));
                }
            }
            for remote in &plc.remote_sensors {
                if !self.peers.contains_key(&remote.peer) {
                    return Err(SimError::InvalidConfiguration(format!(
                        "PLC {:?} reads from unknown peer {:?}",
                        plc.name, remote.peer
                    )));
                }
            }
        }

        if self.initial_custom_flag
            && (self.demand_patterns_path.is_none()
                || self.starting_demand_path.is_none()
                || self.initial_tank_levels_path.is_none())
        {
            return Err(SimError::InvalidConfiguration(
                "initial_custom_flag requires demand_patterns_path, starting_demand_path \
                 and initial_tank_levels_path"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
