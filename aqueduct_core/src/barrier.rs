//! The control-mask barrier between the plant driver and the controllers.
//!
//! Invariant: the mask is zero at the start of an iteration; each
//! controller ORs its disjoint bit in after finishing a control cycle; the
//! driver advances the physical model only once the mask equals the full
//! expected value or its bounded wait budget has expired. The driver then
//! resets the mask and increments the global iteration counter.
//!
//! The wait is a deliberate busy-poll - there is no wake-up channel
//! between independent processes, only the shared store - so both the poll
//! interval and the retry budget are explicit configuration, not
//! constants.

use std::time::Duration;

use aqueduct_store::{tags, StoreError, TagStore, TagValue};
use tracing::warn;

/// Driver-side barrier parameters.
#[derive(Debug, Clone)]
pub struct BarrierConfig {
    /// OR of every configured controller's mask bit.
    pub full_mask: i64,
    /// Sleep between mask polls.
    pub poll_interval: Duration,
    /// Number of polls before the driver gives up and proceeds with
    /// whatever actuator values are present (bounded staleness, not a
    /// correctness guarantee).
    pub max_polls: u32,
}

/// Outcome of one barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every controller reported within the budget.
    Complete,
    /// The budget expired; `observed` is the last mask value seen.
    TimedOut { observed: i64 },
}

/// Polls the mask until it reaches the full value or the budget expires.
///
/// A transient read consumes a poll and is otherwise ignored; `NotFound`
/// propagates, since a missing mask tag means the store was never seeded.
pub fn await_controllers(
    store: &dyn TagStore,
    cfg: &BarrierConfig,
) -> Result<BarrierOutcome, StoreError> {
    let mut observed = 0;
    for _ in 0..cfg.max_polls {
        match store.get_status(tags::CONTROL) {
            Ok(mask) => {
                observed = mask;
                if mask == cfg.full_mask {
                    return Ok(BarrierOutcome::Complete);
                }
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient mask read during barrier wait");
            }
            Err(e) => return Err(e),
        }
        std::thread::sleep(cfg.poll_interval);
    }
    Ok(BarrierOutcome::TimedOut { observed })
}

/// Resets the mask to zero for the next iteration. Driver-owned.
pub fn reset(store: &dyn TagStore) -> Result<(), StoreError> {
    store.set(tags::CONTROL, TagValue::Discrete(0))
}

/// ORs a controller's bit into the mask, returning the merged mask.
///
/// Uses the store's single-key atomic update so two controllers signalling
/// in the same instant cannot lose each other's bit.
pub fn signal(store: &dyn TagStore, mask_bit: i64) -> Result<i64, StoreError> {
    let merged = store.fetch_update(tags::CONTROL, &mut |v| {
        TagValue::Discrete(v.as_status_code() | mask_bit)
    })?;
    Ok(merged.as_status_code())
}

/// Reads the global iteration counter.
pub fn current_iteration(store: &dyn TagStore) -> Result<u64, StoreError> {
    Ok(store.get_status(tags::TIME)?.max(0) as u64)
}

/// Advances the global iteration counter by one. Driver-owned.
pub fn advance_iteration(store: &dyn TagStore) -> Result<u64, StoreError> {
    let next = store.fetch_update(tags::TIME, &mut |v| {
        TagValue::Discrete(v.as_status_code() + 1)
    })?;
    Ok(next.as_status_code().max(0) as u64)
}
