//! Peer addressing for cross-controller sensor reads.
//!
//! Controllers may depend on tank levels owned by another PLC (the rules
//! for pump PU4 read a tank that a different controller publishes). Those
//! dependencies are cyclic in general, so they are modelled as an explicit
//! directed name→address map resolved at startup - never as in-process
//! references between controller objects, which are separate processes by
//! design.
//!
//! The industrial transport that would carry the read on a real network is
//! out of scope; the provided implementation resolves the peer for
//! validation and then reads the tag from the shared store, which holds
//! the same value the peer exposes.

use std::collections::HashMap;
use std::sync::Arc;

use aqueduct_store::{StoreError, TagStore, TagValue};
use serde::{Deserialize, Serialize};

use crate::PlcError;

/// Static map from peer controller name to its network address,
/// loaded once at controller startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerRegistry {
    peers: HashMap<String, String>,
}

impl PeerRegistry {
    pub fn new(peers: HashMap<String, String>) -> Self {
        Self { peers }
    }

    /// Resolves a peer name to its address.
    pub fn resolve(&self, name: &str) -> Result<&str, PlcError> {
        self.peers
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PlcError::UnknownPeer(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }
}

/// Reads a named peer's exposed sensor tags.
pub trait PeerReader: Send + Sync {
    fn read(&self, peer: &str, tag: &str) -> Result<TagValue, PlcError>;
}

/// Store-backed peer reader: resolves the peer through the registry (an
/// unknown peer is still an error, exactly as an unreachable host would
/// be) and serves the tag from the shared store.
pub struct StorePeerReader {
    registry: PeerRegistry,
    store: Arc<dyn TagStore>,
}

impl StorePeerReader {
    pub fn new(registry: PeerRegistry, store: Arc<dyn TagStore>) -> Self {
        Self { registry, store }
    }
}

impl PeerReader for StorePeerReader {
    fn read(&self, peer: &str, tag: &str) -> Result<TagValue, PlcError> {
        self.registry.resolve(peer)?;
        self.store.get(tag).map_err(PlcError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqueduct_store::MemoryTagStore;

    fn registry() -> PeerRegistry {
        let mut peers = HashMap::new();
        peers.insert("plc4".to_string(), "192.168.1.40:44818".to_string());
        PeerRegistry::new(peers)
    }

    #[test]
    fn resolves_known_peer() {
        assert_eq!(registry().resolve("plc4").unwrap(), "192.168.1.40:44818");
    }

    #[test]
    fn unknown_peer_is_an_error() {
        assert!(matches!(
            registry().resolve("plc9"),
            Err(PlcError::UnknownPeer(name)) if name == "plc9"
        ));
    }

    #[test]
    fn store_reader_serves_peer_tags() {
        let store = MemoryTagStore::new();
        store.seed(&[("T3".to_string(), TagValue::Analog(4.2))]);
        let reader = StorePeerReader::new(registry(), Arc::new(store));
        assert_eq!(reader.read("plc4", "T3").unwrap(), TagValue::Analog(4.2));
        assert!(matches!(
            reader.read("plc9", "T3"),
            Err(PlcError::UnknownPeer(_))
        ));
        assert!(matches!(
            reader.read("plc4", "T9"),
            Err(PlcError::Store(StoreError::NotFound(_)))
        ));
    }
}
