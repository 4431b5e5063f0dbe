//! AQUEDUCT Core - coordination protocol and controller logic.
//!
//! The pieces that make independent processes agree on a consistent
//! actuator snapshot every timestep, with the shared tag store as the only
//! communication medium:
//!
//! - [`barrier`] - the control-mask handshake between the plant driver and
//!   the controllers (bounded polling on the driver side, atomic bit OR on
//!   the controller side)
//! - [`control`] - dual-threshold hysteresis rules
//! - [`attack`] - deterministic, iteration-windowed control overrides
//! - [`peers`] - the static peer map through which one controller reads
//!   another's exposed sensor tags
//! - [`plc`] - the controller loop template each PLC instance runs

pub mod attack;
pub mod barrier;
pub mod control;
mod error;
pub mod peers;
pub mod plc;

pub use attack::{AttackCommand, AttackDecision, AttackDescriptor, AttackKind};
pub use barrier::{BarrierConfig, BarrierOutcome};
pub use control::HysteresisRule;
pub use error::PlcError;
pub use peers::{PeerReader, PeerRegistry, StorePeerReader};
pub use plc::{Plc, PlcSpec};
