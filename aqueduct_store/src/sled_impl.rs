//! Durable tag store on an embedded key-value table.

use std::path::Path;

use crate::{StoreError, TagStore, TagValue};

/// Production tag store backed by sled.
///
/// One row per tag, value stored in the canonical text encoding. The
/// database file is the shared medium between the driver and the
/// controllers and persists across restarts, which is what allows a
/// crashed component to resume mid-run from the last committed tag state.
#[derive(Clone)]
pub struct SledTagStore {
    db: sled::Db,
}

impl SledTagStore {
    /// Opens (or creates) a durable store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(StoreError::backend)?;
        Ok(Self { db })
    }

    /// Creates a temporary store that is discarded on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::backend)?;
        Ok(Self { db })
    }

    /// Inserts a batch of initial tag rows, then flushes.
    ///
    /// Existing rows are left untouched so that a restarted run keeps the
    /// state it crashed with.
    pub fn seed(&self, tags: &[(String, TagValue)]) -> Result<(), StoreError> {
        for (name, value) in tags {
            if !self
                .db
                .contains_key(name.as_bytes())
                .map_err(StoreError::backend)?
            {
                self.db
                    .insert(name.as_bytes(), value.encode().into_bytes())
                    .map_err(StoreError::backend)?;
            }
        }
        self.flush()
    }
}

fn decode_bytes(tag: &str, bytes: &[u8]) -> Result<TagValue, StoreError> {
    let raw = std::str::from_utf8(bytes).map_err(|_| StoreError::Codec {
        tag: tag.to_string(),
        raw: String::from_utf8_lossy(bytes).into_owned(),
    })?;
    TagValue::decode(tag, raw)
}

impl TagStore for SledTagStore {
    fn get(&self, name: &str) -> Result<TagValue, StoreError> {
        match self.db.get(name.as_bytes()) {
            Ok(Some(bytes)) => decode_bytes(name, &bytes),
            Ok(None) => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(StoreError::backend(e)),
        }
    }

    fn set(&self, name: &str, value: TagValue) -> Result<(), StoreError> {
        self.db
            .insert(name.as_bytes(), value.encode().into_bytes())
            .map_err(StoreError::backend)?;
        Ok(())
    }

    fn fetch_update(
        &self,
        name: &str,
        f: &mut dyn FnMut(TagValue) -> TagValue,
    ) -> Result<TagValue, StoreError> {
        // sled's closure cannot return an error, so decode failures are
        // captured on the side and re-raised after the merge completes.
        let mut failure: Option<StoreError> = None;
        let merged = self
            .db
            .update_and_fetch(name.as_bytes(), |old| match old {
                None => None,
                Some(bytes) => match decode_bytes(name, bytes) {
                    Ok(value) => Some(f(value).encode().into_bytes()),
                    Err(e) => {
                        failure = Some(e);
                        Some(bytes.to_vec())
                    }
                },
            })
            .map_err(StoreError::backend)?;
        if let Some(e) = failure {
            return Err(e);
        }
        match merged {
            Some(bytes) => decode_bytes(name, &bytes),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(StoreError::backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_round_trip() {
        let store = SledTagStore::temporary().unwrap();
        store.set("T1", TagValue::Analog(3.5)).unwrap();
        assert_eq!(store.get("T1").unwrap(), TagValue::Analog(3.5));
    }

    #[test]
    fn missing_tag_is_not_found() {
        let store = SledTagStore::temporary().unwrap();
        assert!(matches!(
            store.get("NOPE"),
            Err(StoreError::NotFound(name)) if name == "NOPE"
        ));
    }

    #[test]
    fn fetch_update_merges_atomically() {
        let store = SledTagStore::temporary().unwrap();
        store.set("CONTROL", TagValue::Discrete(0)).unwrap();
        let v = store
            .fetch_update("CONTROL", &mut |v| {
                TagValue::Discrete(v.as_status_code() | 0b10)
            })
            .unwrap();
        assert_eq!(v, TagValue::Discrete(2));
        let v = store
            .fetch_update("CONTROL", &mut |v| {
                TagValue::Discrete(v.as_status_code() | 0b01)
            })
            .unwrap();
        assert_eq!(v, TagValue::Discrete(3));
    }

    #[test]
    fn fetch_update_on_missing_tag_fails() {
        let store = SledTagStore::temporary().unwrap();
        assert!(matches!(
            store.fetch_update("CONTROL", &mut |v| v),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn seed_preserves_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledTagStore::open(dir.path()).unwrap();
            store.set("TIME", TagValue::Discrete(7)).unwrap();
            store.flush().unwrap();
        }
        let store = SledTagStore::open(dir.path()).unwrap();
        store
            .seed(&[
                ("TIME".to_string(), TagValue::Discrete(0)),
                ("CONTROL".to_string(), TagValue::Discrete(0)),
            ])
            .unwrap();
        // the crashed run's counter survives; the missing row was added
        assert_eq!(store.get("TIME").unwrap(), TagValue::Discrete(7));
        assert_eq!(store.get("CONTROL").unwrap(), TagValue::Discrete(0));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledTagStore::open(dir.path()).unwrap();
            store.set("V2", TagValue::Discrete(1)).unwrap();
            store.flush().unwrap();
        }
        let store = SledTagStore::open(dir.path()).unwrap();
        assert_eq!(store.get("V2").unwrap(), TagValue::Discrete(1));
    }
}
