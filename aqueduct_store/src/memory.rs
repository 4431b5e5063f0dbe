//! In-memory tag store with deterministic fault injection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{StoreError, TagStore, TagValue};

#[derive(Default)]
struct Inner {
    tags: BTreeMap<String, TagValue>,
    read_faults: u32,
    write_faults: u32,
}

/// Simulation tag store: a plain in-process table.
///
/// Clones share the same underlying table, so a driver and several
/// controller loops can be wired to one instance the same way production
/// components share a database path.
///
/// The fault counters make the transient-error taxonomy testable: the next
/// `n` reads (or writes) fail with a transient error before the backend
/// recovers, which is how the retry budgets and degrade paths are
/// exercised deterministically.
#[derive(Clone, Default)]
pub struct MemoryTagStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a batch of initial tag rows, keeping rows that already exist.
    pub fn seed(&self, tags: &[(String, TagValue)]) {
        let mut inner = self.inner.lock().unwrap();
        for (name, value) in tags {
            inner.tags.entry(name.clone()).or_insert(*value);
        }
    }

    /// Makes the next `n` reads fail with `TransientRead`.
    pub fn inject_read_faults(&self, n: u32) {
        self.inner.lock().unwrap().read_faults = n;
    }

    /// Makes the next `n` writes fail with `TransientWrite`.
    pub fn inject_write_faults(&self, n: u32) {
        self.inner.lock().unwrap().write_faults = n;
    }

    /// A point-in-time copy of the whole table, for test assertions.
    pub fn snapshot(&self) -> BTreeMap<String, TagValue> {
        self.inner.lock().unwrap().tags.clone()
    }
}

impl TagStore for MemoryTagStore {
    fn get(&self, name: &str) -> Result<TagValue, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.read_faults > 0 {
            inner.read_faults -= 1;
            return Err(StoreError::TransientRead(name.to_string()));
        }
        inner
            .tags
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn set(&self, name: &str, value: TagValue) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.write_faults > 0 {
            inner.write_faults -= 1;
            return Err(StoreError::TransientWrite(name.to_string()));
        }
        inner.tags.insert(name.to_string(), value);
        Ok(())
    }

    fn fetch_update(
        &self,
        name: &str,
        f: &mut dyn FnMut(TagValue) -> TagValue,
    ) -> Result<TagValue, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.write_faults > 0 {
            inner.write_faults -= 1;
            return Err(StoreError::TransientWrite(name.to_string()));
        }
        let current = inner
            .tags
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let next = f(current);
        inner.tags.insert(name.to_string(), next);
        Ok(next)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let a = MemoryTagStore::new();
        let b = a.clone();
        a.set("T1", TagValue::Analog(2.0)).unwrap();
        assert_eq!(b.get("T1").unwrap(), TagValue::Analog(2.0));
    }

    #[test]
    fn read_faults_are_consumed() {
        let store = MemoryTagStore::new();
        store.set("T1", TagValue::Analog(1.0)).unwrap();
        store.inject_read_faults(2);
        assert!(store.get("T1").unwrap_err().is_transient());
        assert!(store.get("T1").unwrap_err().is_transient());
        assert_eq!(store.get("T1").unwrap(), TagValue::Analog(1.0));
    }

    #[test]
    fn write_faults_hit_fetch_update_too() {
        let store = MemoryTagStore::new();
        store.set("CONTROL", TagValue::Discrete(0)).unwrap();
        store.inject_write_faults(1);
        assert!(store
            .fetch_update("CONTROL", &mut |v| v)
            .unwrap_err()
            .is_transient());
        let v = store
            .fetch_update("CONTROL", &mut |v| {
                TagValue::Discrete(v.as_status_code() | 1)
            })
            .unwrap();
        assert_eq!(v, TagValue::Discrete(1));
    }

    #[test]
    fn seed_does_not_clobber() {
        let store = MemoryTagStore::new();
        store.set("TIME", TagValue::Discrete(5)).unwrap();
        store.seed(&[("TIME".to_string(), TagValue::Discrete(0))]);
        assert_eq!(store.get("TIME").unwrap(), TagValue::Discrete(5));
    }
}
