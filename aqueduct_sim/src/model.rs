//! The hydraulic solver boundary and the bundled reference model.
//!
//! The driver only ever talks to [`HydraulicModel`]: install actuator
//! boundary conditions, advance exactly one hydraulic timestep, read back
//! per-node and per-link quantities. A real EPANET-class solver plugs in
//! behind the same trait; [`TankNetwork`] is the bundled mass-balance
//! model that makes the testbed self-contained and deterministic.

use std::collections::HashMap;
use std::path::Path;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::debug;

use crate::SimError;

/// Demand model selected by the `simulator` config key.
///
/// `Dd` (demand-driven) serves every demand unconditionally and fails to
/// converge when the network cannot physically sustain it; `Pdd`
/// (pressure-driven) scales demand down with available pressure instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandModel {
    Pdd,
    Dd,
}

/// Link status normalized at the solver boundary.
///
/// Solvers disagree on whether a status is an enum or a raw integer; the
/// conversion happens here, once, so the rest of the system only ever
/// sees status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Closed,
    Open,
}

impl LinkStatus {
    pub fn from_code(code: i64) -> Self {
        if code == 0 {
            Self::Closed
        } else {
            Self::Open
        }
    }

    pub fn as_code(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
        }
    }
}

/// The driver's view of the physical process.
pub trait HydraulicModel: Send {
    fn tank_names(&self) -> &[String];
    fn junction_names(&self) -> &[String];
    fn pump_names(&self) -> &[String];
    fn valve_names(&self) -> &[String];
    /// Hydraulic timestep in seconds; one `advance` call covers exactly
    /// this much simulated time.
    fn timestep_secs(&self) -> u64;
    /// Installs an actuator's commanded status as the boundary condition
    /// for the next step. Returns `false` for an unknown link.
    fn set_actuator_status(&mut self, link: &str, status: LinkStatus) -> bool;
    /// Advances one hydraulic timestep. A convergence failure aborts the
    /// run (the driver still flushes partial results).
    fn advance(&mut self) -> Result<(), String>;
    fn tank_level(&self, name: &str) -> Option<f64>;
    /// Junction pressure: head minus elevation.
    fn junction_pressure(&self, name: &str) -> Option<f64>;
    fn link_flow(&self, name: &str) -> Option<f64>;
    fn link_status(&self, name: &str) -> Option<LinkStatus>;
}

// ── Network description (the `inp_file` consumed by the reference model) ──

fn default_timestep() -> u64 {
    3600
}

fn default_required_pressure() -> f64 {
    20.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TankSpec {
    pub name: String,
    /// Cross-section area, m².
    pub area: f64,
    pub init_level: f64,
    #[serde(default)]
    pub min_level: f64,
    pub max_level: f64,
    #[serde(default)]
    pub elevation: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReservoirSpec {
    pub name: String,
    pub head: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JunctionSpec {
    pub name: String,
    pub elevation: f64,
    /// Demand at multiplier 1.0, m³/s.
    pub base_demand: f64,
    #[serde(default)]
    pub pattern: Option<String>,
    /// Tank this junction draws from; a junction with no source is fed
    /// directly from a reservoir and always satisfied.
    #[serde(default)]
    pub source_tank: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSpec {
    pub name: String,
    /// Upstream node (reservoir or tank).
    pub source: String,
    /// Downstream tank.
    pub target: String,
    /// Flow carried while open, m³/s.
    pub rated_flow: f64,
    #[serde(default)]
    pub initial_status: i64,
}

/// The plant topology and its boundary data, deserialized from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkDescription {
    pub name: String,
    #[serde(default = "default_timestep")]
    pub hydraulic_timestep: u64,
    #[serde(default)]
    pub reservoirs: Vec<ReservoirSpec>,
    pub tanks: Vec<TankSpec>,
    #[serde(default)]
    pub junctions: Vec<JunctionSpec>,
    #[serde(default)]
    pub pumps: Vec<LinkSpec>,
    #[serde(default)]
    pub valves: Vec<LinkSpec>,
    /// Named demand multiplier sequences, indexed per hydraulic step.
    #[serde(default)]
    pub patterns: HashMap<String, Vec<f64>>,
    /// Relative demand jitter amplitude (0 disables).
    #[serde(default)]
    pub demand_noise: f64,
    /// Pressure at which PDD serves full demand.
    #[serde(default = "default_required_pressure")]
    pub required_pressure: f64,
    /// Pressure at and below which PDD serves nothing.
    #[serde(default)]
    pub minimum_pressure: f64,
}

impl NetworkDescription {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SimError::InvalidConfiguration(format!(
                "cannot read network description {}: {e}",
                path.display()
            ))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            SimError::InvalidConfiguration(format!(
                "malformed network description {}: {e}",
                path.display()
            ))
        })
    }
}

// ── Reference model ──────────────────────────────────────────────────────

#[derive(Debug)]
struct Tank {
    spec: TankSpec,
    level: f64,
}

#[derive(Debug)]
struct Junction {
    spec: JunctionSpec,
    pressure: f64,
}

#[derive(Debug)]
struct Link {
    spec: LinkSpec,
    status: LinkStatus,
    flow: f64,
    is_pump: bool,
}

/// Mass-balance reference model.
///
/// Tanks integrate inflow minus outflow over the timestep; pumps and
/// valves carry their rated flow while open; junction pressure derives
/// from the supplying tank's head. Deliberately simple, but it exhibits
/// the dynamics the control layer needs: tanks fill while their pump is
/// on and drain under demand, so hysteresis loops close.
pub struct TankNetwork {
    timestep: u64,
    demand_model: DemandModel,
    tanks: Vec<Tank>,
    reservoirs: HashMap<String, f64>,
    junctions: Vec<Junction>,
    links: Vec<Link>,
    patterns: HashMap<String, Vec<f64>>,
    demand_noise: f64,
    required_pressure: f64,
    minimum_pressure: f64,
    rng: ChaCha8Rng,
    step_index: u64,
    tank_names: Vec<String>,
    junction_names: Vec<String>,
    pump_names: Vec<String>,
    valve_names: Vec<String>,
}

impl TankNetwork {
    /// Builds the model, validating every cross-reference in the
    /// description. The seed keeps demand noise reproducible per
    /// week scenario.
    pub fn from_description(
        desc: NetworkDescription,
        demand_model: DemandModel,
        seed: u64,
    ) -> Result<Self, SimError> {
        let tank_names: Vec<String> = desc.tanks.iter().map(|t| t.name.clone()).collect();
        let junction_names: Vec<String> = desc.junctions.iter().map(|j| j.name.clone()).collect();
        let pump_names: Vec<String> = desc.pumps.iter().map(|p| p.name.clone()).collect();
        let valve_names: Vec<String> = desc.valves.iter().map(|v| v.name.clone()).collect();

        let reservoirs: HashMap<String, f64> = desc
            .reservoirs
            .iter()
            .map(|r| (r.name.clone(), r.head))
            .collect();

        for tank in &desc.tanks {
            if tank.min_level >= tank.max_level {
                return Err(SimError::InvalidConfiguration(format!(
                    "tank {}: min_level must be below max_level",
                    tank.name
                )));
            }
        }
        for junction in &desc.junctions {
            if let Some(pattern) = &junction.pattern {
                if !desc.patterns.contains_key(pattern) {
                    return Err(SimError::InvalidConfiguration(format!(
                        "junction {} references unknown pattern {pattern:?}",
                        junction.name
                    )));
                }
            }
            if let Some(tank) = &junction.source_tank {
                if !tank_names.contains(tank) {
                    return Err(SimError::InvalidConfiguration(format!(
                        "junction {} draws from unknown tank {tank:?}",
                        junction.name
                    )));
                }
            }
        }
        let node_exists = |name: &String| {
            tank_names.contains(name) || reservoirs.contains_key(name.as_str())
        };
        for link in desc.pumps.iter().chain(desc.valves.iter()) {
            if !node_exists(&link.source) {
                return Err(SimError::InvalidConfiguration(format!(
                    "link {} has unknown source {:?}",
                    link.name, link.source
                )));
            }
            if !tank_names.contains(&link.target) {
                return Err(SimError::InvalidConfiguration(format!(
                    "link {} has unknown target tank {:?}",
                    link.name, link.target
                )));
            }
        }

        let tanks = desc
            .tanks
            .iter()
            .map(|spec| Tank {
                level: spec.init_level,
                spec: spec.clone(),
            })
            .collect();
        let junctions = desc
            .junctions
            .iter()
            .map(|spec| Junction {
                pressure: 0.0,
                spec: spec.clone(),
            })
            .collect();
        let links = desc
            .pumps
            .iter()
            .map(|spec| (spec, true))
            .chain(desc.valves.iter().map(|spec| (spec, false)))
            .map(|(spec, is_pump)| Link {
                status: LinkStatus::from_code(spec.initial_status),
                flow: 0.0,
                is_pump,
                spec: spec.clone(),
            })
            .collect();

        Ok(Self {
            timestep: desc.hydraulic_timestep,
            demand_model,
            tanks,
            reservoirs,
            junctions,
            links,
            patterns: desc.patterns,
            demand_noise: desc.demand_noise,
            required_pressure: desc.required_pressure,
            minimum_pressure: desc.minimum_pressure,
            rng: ChaCha8Rng::seed_from_u64(seed),
            step_index: 0,
            tank_names,
            junction_names,
            pump_names,
            valve_names,
        })
    }

    pub fn load(path: &Path, demand_model: DemandModel, seed: u64) -> Result<Self, SimError> {
        Self::from_description(NetworkDescription::load(path)?, demand_model, seed)
    }

    /// Pattern names referenced by at least one junction.
    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns.keys().cloned().collect()
    }

    /// Replaces a pattern's multipliers (week-scenario initialization).
    pub fn set_pattern(&mut self, name: &str, multipliers: Vec<f64>) -> bool {
        match self.patterns.get_mut(name) {
            Some(slot) => {
                *slot = multipliers;
                true
            }
            None => false,
        }
    }

    /// Overrides a tank's starting level (week-scenario initialization).
    pub fn set_initial_level(&mut self, tank: &str, level: f64) -> bool {
        match self.tanks.iter_mut().find(|t| t.spec.name == tank) {
            Some(t) => {
                t.level = level.clamp(t.spec.min_level, t.spec.max_level);
                true
            }
            None => false,
        }
    }

    /// Simulated seconds elapsed since the start of the run.
    pub fn elapsed_secs(&self) -> u64 {
        self.step_index * self.timestep
    }
}

impl HydraulicModel for TankNetwork {
    fn tank_names(&self) -> &[String] {
        &self.tank_names
    }

    fn junction_names(&self) -> &[String] {
        &self.junction_names
    }

    fn pump_names(&self) -> &[String] {
        &self.pump_names
    }

    fn valve_names(&self) -> &[String] {
        &self.valve_names
    }

    fn timestep_secs(&self) -> u64 {
        self.timestep
    }

    fn set_actuator_status(&mut self, link: &str, status: LinkStatus) -> bool {
        match self.links.iter_mut().find(|l| l.spec.name == link) {
            Some(l) => {
                l.status = status;
                true
            }
            None => false,
        }
    }

    fn advance(&mut self) -> Result<(), String> {
        let dt = self.timestep as f64;
        let idx = self.step_index as usize;
        let mut net_flow: HashMap<String, f64> = HashMap::new();

        // demands drawn at junctions, gated by start-of-step pressure
        for junction in &self.junctions {
            let multiplier = junction
                .spec
                .pattern
                .as_ref()
                .and_then(|p| self.patterns.get(p))
                .map(|m| if m.is_empty() { 1.0 } else { m[idx % m.len()] })
                .unwrap_or(1.0);
            let jitter = if self.demand_noise > 0.0 {
                1.0 + self.demand_noise * self.rng.gen_range(-1.0..=1.0)
            } else {
                1.0
            };
            let demand = junction.spec.base_demand * multiplier * jitter;

            let head = match &junction.spec.source_tank {
                Some(tank_name) => self
                    .tanks
                    .iter()
                    .find(|t| t.spec.name == *tank_name)
                    .map(|t| t.spec.elevation + t.level)
                    .unwrap_or(junction.spec.elevation),
                None => junction.spec.elevation + self.required_pressure,
            };
            let pressure = head - junction.spec.elevation;
            let factor = match self.demand_model {
                DemandModel::Dd => 1.0,
                DemandModel::Pdd => {
                    if pressure >= self.required_pressure {
                        1.0
                    } else if pressure <= self.minimum_pressure {
                        0.0
                    } else {
                        ((pressure - self.minimum_pressure)
                            / (self.required_pressure - self.minimum_pressure))
                            .sqrt()
                    }
                }
            };
            let served = demand * factor;
            if let Some(tank) = &junction.spec.source_tank {
                *net_flow.entry(tank.clone()).or_default() -= served;
            }
        }

        // link transfers
        for link in &mut self.links {
            link.flow = match link.status {
                LinkStatus::Closed => 0.0,
                LinkStatus::Open => link.spec.rated_flow,
            };
            if link.flow > 0.0 {
                *net_flow.entry(link.spec.target.clone()).or_default() += link.flow;
                if !self.reservoirs.contains_key(link.spec.source.as_str()) {
                    *net_flow.entry(link.spec.source.clone()).or_default() -= link.flow;
                }
            }
        }

        // integrate tank levels
        for tank in &mut self.tanks {
            let net = net_flow.get(&tank.spec.name).copied().unwrap_or(0.0);
            let mut level = tank.level + net * dt / tank.spec.area;
            if level > tank.spec.max_level {
                // overflow spills
                level = tank.spec.max_level;
            }
            if level < tank.spec.min_level {
                match self.demand_model {
                    DemandModel::Dd => {
                        return Err(format!(
                            "tank {} drained below its minimum level under demand-driven mode",
                            tank.spec.name
                        ));
                    }
                    DemandModel::Pdd => level = tank.spec.min_level,
                }
            }
            tank.level = level;
        }

        // published pressures reflect the post-step heads
        for junction in &mut self.junctions {
            let head = match &junction.spec.source_tank {
                Some(tank_name) => self
                    .tanks
                    .iter()
                    .find(|t| t.spec.name == *tank_name)
                    .map(|t| t.spec.elevation + t.level)
                    .unwrap_or(junction.spec.elevation),
                None => junction.spec.elevation + self.required_pressure,
            };
            junction.pressure = head - junction.spec.elevation;
        }

        self.step_index += 1;
        debug!(step = self.step_index, "hydraulic step complete");
        Ok(())
    }

    fn tank_level(&self, name: &str) -> Option<f64> {
        self.tanks
            .iter()
            .find(|t| t.spec.name == name)
            .map(|t| t.level)
    }

    fn junction_pressure(&self, name: &str) -> Option<f64> {
        self.junctions
            .iter()
            .find(|j| j.spec.name == name)
            .map(|j| j.pressure)
    }

    fn link_flow(&self, name: &str) -> Option<f64> {
        self.links
            .iter()
            .find(|l| l.spec.name == name)
            .map(|l| l.flow)
    }

    fn link_status(&self, name: &str) -> Option<LinkStatus> {
        self.links
            .iter()
            .find(|l| l.spec.name == name)
            .map(|l| l.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn description() -> NetworkDescription {
        serde_yaml::from_str(
            r#"
name: minitown
hydraulic_timestep: 600
reservoirs:
  - { name: R1, head: 60.0 }
tanks:
  - { name: T1, area: 100.0, init_level: 2.0, max_level: 6.0, elevation: 30.0 }
  - { name: T2, area: 50.0, init_level: 1.0, max_level: 4.0, elevation: 20.0 }
junctions:
  - { name: J1, elevation: 10.0, base_demand: 0.02, pattern: DMA1, source_tank: T1 }
pumps:
  - { name: PU1, source: R1, target: T1, rated_flow: 0.05, initial_status: 1 }
valves:
  - { name: V1, source: T1, target: T2, rated_flow: 0.01, initial_status: 0 }
patterns:
  DMA1: [1.0]
"#,
        )
        .unwrap()
    }

    fn model(demand_model: DemandModel) -> TankNetwork {
        TankNetwork::from_description(description(), demand_model, 42).unwrap()
    }

    #[test]
    fn tank_fills_while_pump_runs() {
        let mut m = model(DemandModel::Dd);
        m.advance().unwrap();
        // net inflow (0.05 - 0.02) * 600s / 100m² = +0.18m
        assert_relative_eq!(m.tank_level("T1").unwrap(), 2.18, epsilon = 1e-9);
        assert_relative_eq!(m.link_flow("PU1").unwrap(), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn tank_drains_with_pump_off() {
        let mut m = model(DemandModel::Dd);
        assert!(m.set_actuator_status("PU1", LinkStatus::Closed));
        m.advance().unwrap();
        assert_relative_eq!(m.tank_level("T1").unwrap(), 1.88, epsilon = 1e-9);
        assert_relative_eq!(m.link_flow("PU1").unwrap(), 0.0, epsilon = 1e-12);
        assert_eq!(m.link_status("PU1").unwrap(), LinkStatus::Closed);
    }

    #[test]
    fn junction_pressure_is_head_minus_elevation() {
        let mut m = model(DemandModel::Dd);
        m.advance().unwrap();
        // tank elevation 30 + level 2.18 - junction elevation 10
        assert_relative_eq!(m.junction_pressure("J1").unwrap(), 22.18, epsilon = 1e-9);
    }

    #[test]
    fn dd_mode_fails_on_drained_tank() {
        let mut desc = description();
        desc.tanks[0].init_level = 0.05;
        let mut m = TankNetwork::from_description(desc, DemandModel::Dd, 42).unwrap();
        m.set_actuator_status("PU1", LinkStatus::Closed);
        let err = m.advance().unwrap_err();
        assert!(err.contains("T1"));
    }

    #[test]
    fn pdd_mode_floors_instead_of_failing() {
        let mut desc = description();
        desc.tanks[0].init_level = 0.05;
        let mut m = TankNetwork::from_description(desc, DemandModel::Pdd, 42).unwrap();
        m.set_actuator_status("PU1", LinkStatus::Closed);
        m.advance().unwrap();
        assert_relative_eq!(m.tank_level("T1").unwrap(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn overflow_spills_at_max_level() {
        let mut desc = description();
        desc.tanks[0].init_level = 5.99;
        desc.junctions[0].base_demand = 0.0;
        let mut m = TankNetwork::from_description(desc, DemandModel::Dd, 42).unwrap();
        m.advance().unwrap();
        assert_relative_eq!(m.tank_level("T1").unwrap(), 6.0, epsilon = 1e-12);
    }

    #[test]
    fn unknown_actuator_is_reported() {
        let mut m = model(DemandModel::Dd);
        assert!(!m.set_actuator_status("PU9", LinkStatus::Open));
    }

    #[test]
    fn week_scenario_overrides_pattern_and_level() {
        let mut m = model(DemandModel::Dd);
        assert!(m.set_pattern("DMA1", vec![2.0]));
        assert!(!m.set_pattern("DMA9", vec![2.0]));
        assert!(m.set_initial_level("T1", 4.0));
        m.advance().unwrap();
        // demand doubled: (0.05 - 0.04) * 600 / 100 = +0.06
        assert_relative_eq!(m.tank_level("T1").unwrap(), 4.06, epsilon = 1e-9);
    }

    #[test]
    fn bad_cross_reference_is_rejected() {
        let mut desc = description();
        desc.junctions[0].source_tank = Some("T9".to_string());
        assert!(matches!(
            TankNetwork::from_description(desc, DemandModel::Dd, 42),
            Err(SimError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn demand_noise_is_reproducible_per_seed() {
        let mut desc = description();
        desc.demand_noise = 0.1;
        let mut a = TankNetwork::from_description(desc.clone(), DemandModel::Dd, 7).unwrap();
        let mut b = TankNetwork::from_description(desc, DemandModel::Dd, 7).unwrap();
        a.advance().unwrap();
        b.advance().unwrap();
        assert_eq!(a.tank_level("T1"), b.tank_level("T1"));
    }
}
