//! AQUEDUCT Tag Store Abstraction Layer
//!
//! This crate provides the shared-state seam between the physical process
//! driver and the PLC control loops. The tag store is the *only*
//! communication channel in the system: every component is handed a
//! [`TagStore`] handle at construction and never talks to a peer directly.
//!
//! # Implementations
//!
//! - **Production**: [`SledTagStore`] - a durable embedded key-value table
//!   that survives process restarts, so a driver or controller can resume
//!   a run from the last committed tag state.
//! - **Simulation**: [`MemoryTagStore`] - an in-process fake with
//!   deterministic transient-fault injection, used by the test harness.
//!
//! Values travel as [`TagValue`] scalars encoded to a canonical text form,
//! mirroring the one-row-per-tag `(name, value)` table the store models.

mod error;
mod memory;
mod sled_impl;
mod store;
pub mod tags;

pub use error::StoreError;
pub use memory::MemoryTagStore;
pub use sled_impl::SledTagStore;
pub use store::TagStore;
pub use tags::TagValue;
