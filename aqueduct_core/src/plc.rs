//! The controller loop template each PLC instance runs.
//!
//! One instance owns a disjoint partition of the plant's actuators and a
//! mask bit. Every cycle it reads its sensor inputs (local or via a named
//! peer), applies hysteresis rules, lets an active attack descriptor
//! override the nominal decision, writes the owned actuator tags back and
//! ORs its bit into the control mask. The idle sleep between cycles is a
//! scheduling knob only; correctness comes from the mask, not from timing.
//!
//! A persistence task runs concurrently with the main cycle and shares the
//! in-memory actuator cache under a mutex; on shutdown it snapshots the
//! cache to disk so a restarted controller resumes from last-known state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aqueduct_store::{tags, StoreError, TagStore, TagValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attack::{self, AttackDecision, AttackDescriptor, AttackKind};
use crate::control::HysteresisRule;
use crate::peers::PeerReader;
use crate::PlcError;

fn default_idle_ms() -> u64 {
    50
}

fn default_error_limit() -> u32 {
    100
}

/// A sensor tag owned by another controller, read through the peer map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSensor {
    pub tag: String,
    pub peer: String,
}

/// Static description of one controller: its identity, mask bit, tag
/// assignment and control rules. Loaded from configuration at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcSpec {
    pub name: String,
    /// This controller's disjoint bit in the control mask.
    pub mask_bit: i64,
    /// Network address under which this controller exposes its tags.
    #[serde(default)]
    pub address: String,
    /// Locally owned sensor tags.
    #[serde(default)]
    pub sensors: Vec<String>,
    /// Peer-owned sensor tags this controller's logic needs.
    #[serde(default)]
    pub remote_sensors: Vec<RemoteSensor>,
    /// Hysteresis rules; the rule actuators define this controller's
    /// owned actuator set.
    pub rules: Vec<HysteresisRule>,
    /// Sleep between cycles, in milliseconds.
    #[serde(default = "default_idle_ms")]
    pub idle_ms: u64,
    /// Consecutive transient store errors tolerated before the process
    /// gives up and exits.
    #[serde(default = "default_error_limit")]
    pub max_transient_errors: u32,
    /// When set, force a durable store flush between the actuator writes
    /// and the barrier signal (the write-then-signal ordering knob).
    #[serde(default)]
    pub flush_before_signal: bool,
}

type ActuatorCache = BTreeMap<String, i64>;

/// One running controller instance.
pub struct Plc {
    spec: PlcSpec,
    store: Arc<dyn TagStore>,
    peers: Arc<dyn PeerReader>,
    attack: Option<AttackDescriptor>,
    owned: HashSet<String>,
    remote_map: HashMap<String, String>,
    cache: Arc<Mutex<ActuatorCache>>,
    shutdown: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    state_path: Option<PathBuf>,
    local_time: u64,
    transient_errors: u32,
    attack_active: bool,
}

impl Plc {
    /// Builds a controller and seeds its actuator cache.
    ///
    /// Cache seeding order: the store is authoritative; a state snapshot
    /// from a previous run fills in tags the store has lost, and is
    /// written back so both agree again. An actuator present in neither
    /// is a missing required tag and fatal at startup.
    pub fn new(
        spec: PlcSpec,
        store: Arc<dyn TagStore>,
        peers: Arc<dyn PeerReader>,
        attack: Option<AttackDescriptor>,
        shutdown: Arc<AtomicBool>,
        state_dir: Option<&Path>,
    ) -> Result<Self, PlcError> {
        let local: HashSet<&str> = spec.sensors.iter().map(String::as_str).collect();
        let remote_map: HashMap<String, String> = spec
            .remote_sensors
            .iter()
            .map(|r| (r.tag.clone(), r.peer.clone()))
            .collect();
        let mut owned = HashSet::new();
        for rule in &spec.rules {
            rule.validate()?;
            if !local.contains(rule.sensor.as_str()) && !remote_map.contains_key(&rule.sensor) {
                return Err(PlcError::UnmappedSensor(rule.sensor.clone()));
            }
            owned.insert(rule.actuator.clone());
        }

        let state_path = state_dir.map(|d| d.join(format!("{}_state.json", spec.name)));
        let snapshot = match &state_path {
            Some(path) if path.exists() => load_snapshot(path)?,
            _ => ActuatorCache::new(),
        };

        let mut cache = ActuatorCache::new();
        for actuator in &owned {
            match store.get_status(actuator) {
                Ok(status) => {
                    cache.insert(actuator.clone(), status);
                }
                Err(StoreError::NotFound(_)) => match snapshot.get(actuator) {
                    Some(status) => {
                        store.set(actuator, TagValue::Discrete(*status))?;
                        cache.insert(actuator.clone(), *status);
                    }
                    None => return Err(StoreError::NotFound(actuator.clone()).into()),
                },
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Self {
            spec,
            store,
            peers,
            attack,
            owned,
            remote_map,
            cache: Arc::new(Mutex::new(cache)),
            shutdown,
            stopped: Arc::new(AtomicBool::new(false)),
            state_path,
            local_time: 0,
            transient_errors: 0,
            attack_active: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The actuator tags this controller owns.
    pub fn owned_actuators(&self) -> &HashSet<String> {
        &self.owned
    }

    /// Runs cycles until the shutdown flag is raised or a fatal error
    /// occurs. The actuator cache is snapshotted on every exit path.
    pub fn run(&mut self) -> Result<(), PlcError> {
        info!(plc = %self.spec.name, mask_bit = self.spec.mask_bit, "controller entering main loop");
        let persister = self.spawn_persistence_task();

        let result = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!(plc = %self.spec.name, "shutdown signal received");
                break Ok(());
            }
            match self.cycle() {
                Ok(()) => {
                    self.transient_errors = 0;
                }
                Err(PlcError::Store(e)) if e.is_transient() => {
                    self.transient_errors += 1;
                    warn!(
                        plc = %self.spec.name,
                        error = %e,
                        consecutive = self.transient_errors,
                        "transient store error, retrying cycle"
                    );
                    if self.transient_errors >= self.spec.max_transient_errors {
                        break Err(PlcError::TooManyTransientErrors(self.transient_errors));
                    }
                }
                Err(e) => break Err(e),
            }
            std::thread::sleep(Duration::from_millis(self.spec.idle_ms));
        };

        self.stopped.store(true, Ordering::Relaxed);
        if let Some(handle) = persister {
            let _ = handle.join();
        }
        self.persist();
        result
    }

    /// One control cycle: ReadInputs → Decide → ApplyAttackOverride →
    /// WriteOutputs → SignalBarrier. A transient store error anywhere
    /// aborts the cycle without signalling; the next pass retries from
    /// the reads.
    pub fn cycle(&mut self) -> Result<(), PlcError> {
        let iteration = crate::barrier::current_iteration(self.store.as_ref())?;
        self.publish_attack_flag(iteration)?;

        // ReadInputs
        let mut levels: HashMap<String, f64> = HashMap::new();
        for rule in &self.spec.rules {
            if levels.contains_key(&rule.sensor) {
                continue;
            }
            let value = match self.remote_map.get(&rule.sensor) {
                Some(peer) => self.peers.read(peer, &rule.sensor)?,
                None => self.store.get(&rule.sensor)?,
            };
            levels.insert(rule.sensor.clone(), value.as_analog());
        }

        // Decide + ApplyAttackOverride + WriteOutputs under the cache lock
        {
            let mut cache = self.cache.lock().unwrap();
            let mut planned: Vec<(String, i64)> = Vec::with_capacity(self.spec.rules.len());
            for rule in &self.spec.rules {
                let current = cache.get(&rule.actuator).copied().unwrap_or(0);
                planned.push((rule.actuator.clone(), rule.evaluate(levels[&rule.sensor], current)));
            }

            let mut suppressed: HashSet<String> = HashSet::new();
            if let Some(descriptor) = &self.attack {
                match attack::decide(iteration, descriptor) {
                    AttackDecision::Activate(cmd) => {
                        if !self.attack_active {
                            info!(
                                plc = %self.spec.name,
                                attack = %descriptor.name,
                                iteration,
                                "attack window opened, overriding control decisions"
                            );
                            self.attack_active = true;
                        }
                        for (actuator, value) in planned.iter_mut() {
                            if !descriptor.actuators.contains(actuator) {
                                continue;
                            }
                            let current = cache.get(actuator).copied().unwrap_or(0);
                            match cmd.apply(current) {
                                Some(forced) => *value = forced,
                                None => {
                                    // Maintain: previous value persists
                                    suppressed.insert(actuator.clone());
                                }
                            }
                        }
                    }
                    AttackDecision::Deactivate if self.attack_active => {
                        info!(
                            plc = %self.spec.name,
                            attack = %descriptor.name,
                            iteration,
                            "attack window closed, nominal control restored"
                        );
                        self.attack_active = false;
                    }
                    _ => {}
                }
            }

            for (actuator, value) in &planned {
                if suppressed.contains(actuator) {
                    continue;
                }
                self.store.set(actuator, TagValue::Discrete(*value))?;
                cache.insert(actuator.clone(), *value);
            }
        }

        if self.spec.flush_before_signal {
            self.store.flush()?;
        }

        // SignalBarrier
        crate::barrier::signal(self.store.as_ref(), self.spec.mask_bit)?;

        self.local_time += 1;
        if self.local_time % 100 == 0 {
            debug!(plc = %self.spec.name, cycles = self.local_time, iteration, "controller alive");
        }
        Ok(())
    }

    /// Writes the actuator-side attack flag.
    ///
    /// For concealment kinds the activation is determined by the driver on
    /// the sensor side and mirrored here, so the two flags are raised by
    /// different components. For plain overrides this controller decides
    /// from the iteration window itself.
    fn publish_attack_flag(&self, iteration: u64) -> Result<(), PlcError> {
        let Some(descriptor) = &self.attack else {
            return Ok(());
        };
        if !descriptor.targets_any(&self.owned) {
            return Ok(());
        }
        let flag = match descriptor.kind {
            AttackKind::Device | AttackKind::Network => {
                match self.store.get_status(tags::ATT_SENSOR) {
                    Ok(v) => v,
                    Err(StoreError::NotFound(_)) => 0,
                    Err(e) => return Err(e.into()),
                }
            }
            AttackKind::None => attack::flag_value(iteration, descriptor),
        };
        self.store.set(tags::ATT_ACTUATOR, TagValue::Discrete(flag))?;
        Ok(())
    }

    fn spawn_persistence_task(&self) -> Option<std::thread::JoinHandle<()>> {
        let path = self.state_path.clone()?;
        let cache = Arc::clone(&self.cache);
        let shutdown = Arc::clone(&self.shutdown);
        let stopped = Arc::clone(&self.stopped);
        let name = self.spec.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-persist"))
            .spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) || stopped.load(Ordering::Relaxed) {
                    let snapshot = cache.lock().unwrap().clone();
                    if let Err(e) = write_snapshot(&path, &snapshot) {
                        warn!(plc = %name, error = %e, "failed to persist actuator state");
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(200));
            })
            .ok()?;
        Some(handle)
    }

    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let snapshot = self.cache.lock().unwrap().clone();
        if let Err(e) = write_snapshot(path, &snapshot) {
            warn!(plc = %self.spec.name, error = %e, "failed to persist actuator state");
        }
    }
}

fn write_snapshot(path: &Path, cache: &ActuatorCache) -> Result<(), PlcError> {
    let json = serde_json::to_string_pretty(cache)
        .map_err(|e| PlcError::Snapshot(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| PlcError::Snapshot(e.to_string()))
}

fn load_snapshot(path: &Path) -> Result<ActuatorCache, PlcError> {
    let raw = std::fs::read_to_string(path).map_err(|e| PlcError::Snapshot(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| PlcError::Snapshot(e.to_string()))
}
