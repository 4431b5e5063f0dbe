//! The physical process driver.
//!
//! Owns the simulation clock and the barrier. Each iteration:
//! wait for the control mask (bounded), install the commanded actuator
//! statuses as boundary conditions, advance the hydraulic model one
//! timestep, publish the resulting sensor values back to the store,
//! append a ground-truth row, then reset the mask and advance the global
//! iteration counter. After the configured iteration limit the
//! accumulated rows are flushed to the output artifact.
//!
//! Store failures during a step are retried under a bounded budget and
//! then degrade to skipping that field for the current row; only a solver
//! convergence failure is fatal, and even then the partial results are
//! flushed first.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aqueduct_core::attack::{self, AttackDescriptor, AttackKind};
use aqueduct_core::barrier::{self, BarrierConfig, BarrierOutcome};
use aqueduct_store::{tags, StoreError, TagStore, TagValue};
use tracing::{error, info, warn};

use crate::model::{HydraulicModel, LinkStatus};
use crate::results::{ResultRow, ResultsRecorder};
use crate::SimError;

/// Driver parameters, resolved from the simulation configuration.
pub struct DriverConfig {
    pub iteration_limit: u64,
    pub barrier: BarrierConfig,
    /// Bounded retry budget for a single store read/write.
    pub store_retries: u32,
    pub retry_interval: Duration,
    /// Attack carried by the run; the driver raises the sensor-side flag
    /// for concealment kinds.
    pub attack: Option<AttackDescriptor>,
    pub output_path: PathBuf,
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default)]
pub struct DriverReport {
    /// Iterations completed by this driver instance.
    pub iterations: u64,
    /// Iterations where the barrier budget expired and the driver
    /// proceeded with stale actuator values.
    pub barrier_timeouts: u64,
    /// Row fields skipped after the store retry budget ran out.
    pub skipped_fields: u64,
    pub rows_written: usize,
}

/// The driver state machine.
pub struct PhysicalPlant<M> {
    model: M,
    store: Arc<dyn TagStore>,
    cfg: DriverConfig,
    recorder: ResultsRecorder,
    shutdown: Arc<AtomicBool>,
    master_time: u64,
    timestep: u64,
    report: DriverReport,
    tank_names: Vec<String>,
    junction_names: Vec<String>,
    pump_names: Vec<String>,
    valve_names: Vec<String>,
}

fn ensure(store: &dyn TagStore, name: &str, value: TagValue) -> Result<(), StoreError> {
    match store.get(name) {
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) => store.set(name, value),
        Err(e) => Err(e),
    }
}

impl<M: HydraulicModel> PhysicalPlant<M> {
    /// Builds the driver and seeds the store with the initial plant
    /// state: protocol tags, sensor tags at their starting values, and
    /// every actuator's initial status. Rows that already exist are left
    /// alone, which is what lets a restarted driver resume a run - the
    /// iteration counter is recovered from the store.
    pub fn new(
        model: M,
        store: Arc<dyn TagStore>,
        cfg: DriverConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, SimError> {
        let tank_names = model.tank_names().to_vec();
        let junction_names = model.junction_names().to_vec();
        let pump_names = model.pump_names().to_vec();
        let valve_names = model.valve_names().to_vec();
        let recorder =
            ResultsRecorder::new(&tank_names, &junction_names, &pump_names, &valve_names);
        let timestep = model.timestep_secs();

        ensure(store.as_ref(), tags::CONTROL, TagValue::Discrete(0))?;
        ensure(store.as_ref(), tags::TIME, TagValue::Discrete(0))?;
        ensure(store.as_ref(), tags::ATT_ACTUATOR, TagValue::Discrete(0))?;
        ensure(store.as_ref(), tags::ATT_SENSOR, TagValue::Discrete(0))?;
        for tank in &tank_names {
            let level = model.tank_level(tank).unwrap_or(0.0);
            ensure(store.as_ref(), tank, TagValue::Analog(level))?;
        }
        for junction in &junction_names {
            let pressure = model.junction_pressure(junction).unwrap_or(0.0);
            ensure(store.as_ref(), junction, TagValue::Analog(pressure))?;
        }
        for link in pump_names.iter().chain(valve_names.iter()) {
            let status = model
                .link_status(link)
                .unwrap_or(LinkStatus::Closed)
                .as_code();
            ensure(store.as_ref(), link, TagValue::Discrete(status))?;
            ensure(store.as_ref(), &tags::flow_tag(link), TagValue::Analog(0.0))?;
        }
        store.flush()?;

        let master_time = store.get_status(tags::TIME)?.max(0) as u64;
        if master_time > 0 {
            info!(
                resumed_at = master_time,
                "iteration counter recovered from the store, resuming mid-run"
            );
        }

        Ok(Self {
            model,
            store,
            cfg,
            recorder,
            shutdown,
            master_time,
            timestep,
            report: DriverReport::default(),
            tank_names,
            junction_names,
            pump_names,
            valve_names,
        })
    }

    pub fn master_time(&self) -> u64 {
        self.master_time
    }

    pub fn report(&self) -> &DriverReport {
        &self.report
    }

    pub fn recorder(&self) -> &ResultsRecorder {
        &self.recorder
    }

    /// Runs iterations until the limit or a shutdown signal, then writes
    /// the output artifact. On a fatal error the partial results are
    /// flushed before the error propagates.
    pub fn run(&mut self) -> Result<DriverReport, SimError> {
        info!(
            iteration_limit = self.cfg.iteration_limit,
            timestep_secs = self.timestep,
            "physical process driver starting"
        );
        while self.master_time < self.cfg.iteration_limit {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("shutdown signal received, stopping before the iteration limit");
                break;
            }
            if let Err(e) = self.step() {
                error!(error = %e, "fatal error mid-run, flushing partial results");
                if let Err(flush_err) = self.finalize() {
                    error!(error = %flush_err, "partial-results flush failed");
                }
                return Err(e);
            }
        }
        self.finalize()?;
        Ok(self.report.clone())
    }

    /// One full iteration of the driver state machine.
    pub fn step(&mut self) -> Result<(), SimError> {
        // WaitBarrier
        match barrier::await_controllers(self.store.as_ref(), &self.cfg.barrier)? {
            BarrierOutcome::Complete => {}
            BarrierOutcome::TimedOut { observed } => {
                warn!(
                    iteration = self.master_time,
                    observed_mask = observed,
                    expected_mask = self.cfg.barrier.full_mask,
                    "barrier budget expired, proceeding with stale actuator values"
                );
                self.report.barrier_timeouts += 1;
            }
        }

        // ApplyActuators
        let actuators: Vec<String> = self
            .pump_names
            .iter()
            .chain(self.valve_names.iter())
            .cloned()
            .collect();
        for name in &actuators {
            match self.get_with_retry(name) {
                Ok(value) => {
                    let status = LinkStatus::from_code(value.as_status_code());
                    if !self.model.set_actuator_status(name, status) {
                        warn!(actuator = %name, "model rejected unknown actuator");
                    }
                }
                Err(e) => {
                    warn!(actuator = %name, error = %e, "skipping actuator update this iteration");
                    self.report.skipped_fields += 1;
                }
            }
        }

        // Advance - a convergence failure aborts the run
        self.model.advance().map_err(|detail| SimError::Convergence {
            iteration: self.master_time,
            detail,
        })?;

        // PublishSensors
        let timestamp_secs = (self.master_time + 1) * self.timestep;
        let mut tank_levels = Vec::with_capacity(self.tank_names.len());
        for tank in &self.tank_names.clone() {
            match self.model.tank_level(tank) {
                Some(level) => tank_levels.push(self.publish_analog(tank, level)),
                None => tank_levels.push(None),
            }
        }
        let mut junction_pressures = Vec::with_capacity(self.junction_names.len());
        for junction in &self.junction_names.clone() {
            match self.model.junction_pressure(junction) {
                Some(pressure) => junction_pressures.push(self.publish_analog(junction, pressure)),
                None => junction_pressures.push(None),
            }
        }
        let pumps = self.publish_links(&self.pump_names.clone());
        let valves = self.publish_links(&self.valve_names.clone());

        let row = ResultRow {
            timestamp_secs,
            tank_levels,
            junction_pressures,
            pumps,
            valves,
            attack_actuator: self.read_flag(tags::ATT_ACTUATOR),
            attack_sensor: self.read_flag(tags::ATT_SENSOR),
        };
        self.recorder.append(row);

        // ResetBarrier
        if let Err(e) = self.set_with_retry(tags::CONTROL, TagValue::Discrete(0)) {
            warn!(error = %e, "mask reset failed, next iteration may see stale bits");
        }
        self.master_time += 1;
        if let Err(e) = self.set_with_retry(
            tags::TIME,
            TagValue::Discrete(self.master_time as i64),
        ) {
            warn!(error = %e, "iteration counter write failed, controllers see stale time");
        }

        // Sensor-side attack flag for the iteration about to run.
        // Raised here, by the driver, so concealment attacks have their
        // activation visible to a component other than the overriding
        // controller.
        if let Some(descriptor) = &self.cfg.attack {
            if matches!(descriptor.kind, AttackKind::Device | AttackKind::Network) {
                let flag = attack::flag_value(self.master_time, descriptor);
                if let Err(e) =
                    self.set_with_retry(tags::ATT_SENSOR, TagValue::Discrete(flag))
                {
                    warn!(error = %e, "sensor-side attack flag write failed");
                }
            }
        }

        self.report.iterations += 1;
        Ok(())
    }

    /// Writes the output artifact with everything recorded so far.
    pub fn finalize(&mut self) -> Result<(), SimError> {
        let rows = self.recorder.write_to(&self.cfg.output_path)?;
        self.report.rows_written = rows;
        Ok(())
    }

    fn publish_links(&mut self, names: &[String]) -> Vec<(Option<f64>, Option<i64>)> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let flow = match self.model.link_flow(name) {
                Some(flow) => self.publish_analog(&tags::flow_tag(name), flow),
                None => None,
            };
            let status = self.model.link_status(name).map(|s| s.as_code());
            out.push((flow, status));
        }
        out
    }

    /// Publishes one sensor value; a write failure after the retry budget
    /// skips the field for this row.
    fn publish_analog(&mut self, tag: &str, value: f64) -> Option<f64> {
        match self.set_with_retry(tag, TagValue::Analog(value)) {
            Ok(()) => Some(value),
            Err(e) => {
                warn!(tag = %tag, error = %e, "sensor publish failed, skipping field");
                self.report.skipped_fields += 1;
                None
            }
        }
    }

    fn read_flag(&mut self, tag: &str) -> i64 {
        match self.get_with_retry(tag) {
            Ok(value) => value.as_status_code(),
            Err(StoreError::NotFound(_)) => 0,
            Err(e) => {
                warn!(tag = %tag, error = %e, "attack flag read failed, recording 0");
                self.report.skipped_fields += 1;
                0
            }
        }
    }

    fn get_with_retry(&self, name: &str) -> Result<TagValue, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.get(name) {
                Err(e) if e.is_transient() && attempt < self.cfg.store_retries => {
                    attempt += 1;
                    std::thread::sleep(self.cfg.retry_interval);
                }
                other => return other,
            }
        }
    }

    fn set_with_retry(&self, name: &str, value: TagValue) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.set(name, value) {
                Err(e) if e.is_transient() && attempt < self.cfg.store_retries => {
                    attempt += 1;
                    std::thread::sleep(self.cfg.retry_interval);
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DemandModel, NetworkDescription, TankNetwork};
    use aqueduct_store::MemoryTagStore;

    fn network(init_level: f64) -> TankNetwork {
        let desc: NetworkDescription = serde_yaml::from_str(&format!(
            r#"
name: testnet
hydraulic_timestep: 600
reservoirs:
  - {{ name: R1, head: 60.0 }}
tanks:
  - {{ name: T1, area: 100.0, init_level: {init_level}, max_level: 6.0, elevation: 30.0 }}
junctions:
  - {{ name: J1, elevation: 10.0, base_demand: 0.02, source_tank: T1 }}
pumps:
  - {{ name: PU1, source: R1, target: T1, rated_flow: 0.05, initial_status: 1 }}
"#
        ))
        .unwrap();
        TankNetwork::from_description(desc, DemandModel::Dd, 0).unwrap()
    }

    fn driver_cfg(limit: u64, full_mask: i64, out: PathBuf) -> DriverConfig {
        DriverConfig {
            iteration_limit: limit,
            barrier: BarrierConfig {
                full_mask,
                poll_interval: Duration::from_millis(1),
                max_polls: 3,
            },
            store_retries: 2,
            retry_interval: Duration::from_millis(1),
            attack: None,
            output_path: out,
        }
    }

    fn plant(
        limit: u64,
        full_mask: i64,
        store: Arc<MemoryTagStore>,
        out: PathBuf,
    ) -> PhysicalPlant<TankNetwork> {
        PhysicalPlant::new(
            network(2.0),
            store,
            driver_cfg(limit, full_mask, out),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn seeds_protocol_and_sensor_tags() {
        let store = Arc::new(MemoryTagStore::new());
        let _plant = plant(1, 0, store.clone(), "out.csv".into());
        assert_eq!(store.get_status(tags::CONTROL).unwrap(), 0);
        assert_eq!(store.get_status(tags::TIME).unwrap(), 0);
        assert_eq!(store.get_analog("T1").unwrap(), 2.0);
        assert_eq!(store.get_status("PU1").unwrap(), 1);
        assert_eq!(store.get_analog("PU1F").unwrap(), 0.0);
    }

    #[test]
    fn produces_one_row_per_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("gt.csv");
        let store = Arc::new(MemoryTagStore::new());
        let mut plant = plant(4, 0, store.clone(), out.clone());
        let report = plant.run().unwrap();
        assert_eq!(report.iterations, 4);
        assert_eq!(report.rows_written, 4);
        let contents = std::fs::read_to_string(&out).unwrap();
        assert_eq!(contents.lines().count(), 5);
        // iteration counter advanced once per iteration
        assert_eq!(store.get_status(tags::TIME).unwrap(), 4);
    }

    #[test]
    fn applies_actuator_commands_from_the_store() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        let mut plant = plant(2, 0, store.clone(), dir.path().join("gt.csv"));
        // someone commands the pump off before the first iteration
        store.set("PU1", TagValue::Discrete(0)).unwrap();
        plant.step().unwrap();
        // tank drains: 2.0 - 0.02*600/100
        let level = store.get_analog("T1").unwrap();
        assert!((level - 1.88).abs() < 1e-9);
        assert_eq!(plant.recorder().rows()[0].pumps[0].1, Some(0));
    }

    #[test]
    fn barrier_timeout_degrades_instead_of_stalling() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        // full mask 1 but nobody ever signals
        let mut plant = plant(3, 1, store.clone(), dir.path().join("gt.csv"));
        let report = plant.run().unwrap();
        assert_eq!(report.iterations, 3);
        assert_eq!(report.barrier_timeouts, 3);
    }

    #[test]
    fn completes_when_a_controller_signals() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        let mut plant = PhysicalPlant::new(
            network(2.0),
            store.clone(),
            DriverConfig {
                iteration_limit: 2,
                barrier: BarrierConfig {
                    full_mask: 1,
                    poll_interval: Duration::from_millis(1),
                    max_polls: 500,
                },
                store_retries: 2,
                retry_interval: Duration::from_millis(1),
                attack: None,
                output_path: dir.path().join("gt.csv"),
            },
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let signaller = store.clone();
        let handle = std::thread::spawn(move || {
            // signal once per iteration, waiting for the driver's reset
            for _ in 0..2 {
                loop {
                    match signaller.get_status(tags::CONTROL) {
                        Ok(0) => break,
                        _ => std::thread::sleep(Duration::from_millis(1)),
                    }
                }
                aqueduct_core::barrier::signal(signaller.as_ref(), 1).unwrap();
            }
        });
        let report = plant.run().unwrap();
        handle.join().unwrap();
        assert_eq!(report.iterations, 2);
        assert_eq!(report.barrier_timeouts, 0);
    }

    #[test]
    fn write_fault_skips_the_field_not_the_row() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        let mut plant = PhysicalPlant::new(
            network(2.0),
            store.clone(),
            DriverConfig {
                iteration_limit: 1,
                barrier: BarrierConfig {
                    full_mask: 0,
                    poll_interval: Duration::from_millis(1),
                    max_polls: 1,
                },
                store_retries: 0,
                retry_interval: Duration::from_millis(1),
                attack: None,
                output_path: dir.path().join("gt.csv"),
            },
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        // the first write after Advance is the T1 level publish
        store.inject_write_faults(1);
        plant.step().unwrap();
        let row = &plant.recorder().rows()[0];
        assert!(row.tank_levels[0].is_none());
        assert!(row.junction_pressures[0].is_some());
        assert!(plant.report().skipped_fields >= 1);
    }

    #[test]
    fn convergence_failure_flushes_partial_results() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("gt.csv");
        let mut plant = PhysicalPlant::new(
            network(0.15),
            store.clone(),
            driver_cfg(10, 0, out.clone()),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        // pump commanded off: the tank drains dry in DD mode
        store.set("PU1", TagValue::Discrete(0)).unwrap();
        let err = plant.run().unwrap_err();
        assert!(matches!(err, SimError::Convergence { .. }));
        // the row gathered before the failure was still written
        let contents = std::fs::read_to_string(&out).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn resumes_from_persisted_iteration_counter() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        {
            let mut plant = plant(3, 0, store.clone(), dir.path().join("a.csv"));
            plant.run().unwrap();
        }
        let mut second = PhysicalPlant::new(
            network(2.0),
            store.clone(),
            driver_cfg(5, 0, dir.path().join("b.csv")),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        assert_eq!(second.master_time(), 3);
        let report = second.run().unwrap();
        assert_eq!(report.iterations, 2);
    }

    #[test]
    fn shutdown_stops_early_but_flushes() {
        let store = Arc::new(MemoryTagStore::new());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("gt.csv");
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut plant = PhysicalPlant::new(
            network(2.0),
            store,
            driver_cfg(100, 0, out.clone()),
            shutdown,
        )
        .unwrap();
        let report = plant.run().unwrap();
        assert_eq!(report.iterations, 0);
        assert!(out.exists());
    }
}
