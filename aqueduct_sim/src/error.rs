//! Harness-level error types.

use aqueduct_core::PlcError;
use aqueduct_store::StoreError;
use thiserror::Error;

/// Errors raised by the simulation harness and the plant driver.
#[derive(Debug, Error)]
pub enum SimError {
    /// Malformed configuration (unknown simulator mode, overlapping mask
    /// bits, missing input tables). Fatal at startup with a non-zero
    /// exit; no partial run is attempted.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The hydraulic solver failed to converge. Fatal: the run aborts,
    /// but results gathered so far are still flushed.
    #[error("hydraulic solver failed to converge at iteration {iteration}: {detail}")]
    Convergence { iteration: u64, detail: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("controller error: {0}")]
    Plc(#[from] PlcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
