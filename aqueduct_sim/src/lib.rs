//! AQUEDUCT plant simulation harness.
//!
//! Hosts the physical-process driver that owns the simulation clock and
//! the barrier, a bundled reference hydraulic model behind the
//! [`model::HydraulicModel`] seam, the ground-truth recorder, and the
//! scenario runner that wires a tag store, the driver and N controller
//! loops together for a full run.

pub mod config;
pub mod driver;
mod error;
pub mod model;
pub mod results;
pub mod scenario;
pub mod tables;

pub use config::SimulationConfig;
pub use driver::{DriverConfig, DriverReport, PhysicalPlant};
pub use error::SimError;
pub use model::{DemandModel, HydraulicModel, LinkStatus, TankNetwork};
pub use results::{ResultRow, ResultsRecorder};
pub use scenario::ScenarioOutcome;
