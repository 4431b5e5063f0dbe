//! Controller-side error types.

use aqueduct_store::StoreError;
use thiserror::Error;

/// Errors raised by a PLC instance.
///
/// Only `Store` carries transient cases; everything else is a
/// configuration or lifecycle failure that terminates the owning process.
/// Failures never propagate across processes - a crashed controller is
/// visible to the driver only as a barrier bit that stops arriving.
#[derive(Debug, Error)]
pub enum PlcError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The peer map has no entry for a referenced controller.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// A rule references a sensor that is neither locally owned nor
    /// mapped to a peer.
    #[error("sensor {0} is neither local nor mapped to a peer")]
    UnmappedSensor(String),

    /// Thresholds must satisfy `low_mark < high_mark`.
    #[error("invalid rule for {actuator}: low_mark {low} must be below high_mark {high}")]
    InvalidRule {
        actuator: String,
        low: f64,
        high: f64,
    },

    /// The consecutive transient-error budget was exceeded; the process
    /// exits so an orchestrator can restart it.
    #[error("aborting after {0} consecutive transient store errors")]
    TooManyTransientErrors(u32),

    /// Reading or writing the actuator state snapshot failed.
    #[error("state snapshot error: {0}")]
    Snapshot(String),

    /// Malformed or unresolvable configuration (bad attack file, unknown
    /// attack name). Fatal at startup; no partial run is attempted.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}
