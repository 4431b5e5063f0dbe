//! The `TagStore` trait: the system's sole inter-process channel.

use crate::{StoreError, TagValue};

/// Shared mutable tag table, injected into every component.
///
/// Reads and writes are atomic per call; there are no multi-key
/// transactions. All protocol correctness is built from single-key
/// operations plus the control-mask convention, with write ownership of
/// each tag partitioned by convention (one writer per tag, except actuator
/// tags during an active attack window).
///
/// `fetch_update` is the one read-modify-write primitive: a single-key
/// atomic update used by controllers to OR their barrier bit into the mask
/// without losing a concurrent peer's bit.
pub trait TagStore: Send + Sync {
    /// Reads the current value of a tag.
    fn get(&self, name: &str) -> Result<TagValue, StoreError>;

    /// Upserts a tag value.
    fn set(&self, name: &str, value: TagValue) -> Result<(), StoreError>;

    /// Atomically replaces a tag's value with `f(current)`, returning the
    /// new value. Fails with `NotFound` if the tag does not exist.
    fn fetch_update(
        &self,
        name: &str,
        f: &mut dyn FnMut(TagValue) -> TagValue,
    ) -> Result<TagValue, StoreError>;

    /// Forces pending writes to the durability layer. A no-op for
    /// in-memory backends.
    fn flush(&self) -> Result<(), StoreError>;

    /// Reads a tag as a physical quantity.
    fn get_analog(&self, name: &str) -> Result<f64, StoreError> {
        Ok(self.get(name)?.as_analog())
    }

    /// Reads a tag as an integer status code.
    fn get_status(&self, name: &str) -> Result<i64, StoreError> {
        Ok(self.get(name)?.as_status_code())
    }
}
