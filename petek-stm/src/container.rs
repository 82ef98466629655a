//! Versioned backing stores for ref state.
//!
//! A ref's history is an ordered chain of `(version, bytes)` pairs, the
//! version being the id of the committing transaction. Two backends
//! implement the same contract: the coordinator-backed store used in
//! production and a node-local store for benchmarks and same-process
//! tests. Pruning keeps the newest `retention` versions; reads below the
//! retained window surface `StaleRead`.

use crate::errors::StmError;
use crate::txn::TxnId;
use dashmap::DashMap;
use parking_lot::Mutex;
use petek::{CoordError, Coordinator, CreateMode};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Durable version chain for a single ref.
pub trait StateContainer: Send + Sync {
    /// Materialize backing storage. Idempotent.
    fn init_state(&self) -> Result<(), StmError>;

    /// Bytes committed under exactly `version`.
    fn get_state(&self, version: TxnId) -> Result<Vec<u8>, StmError>;

    /// Record `bytes` as the version committed by `version`. Idempotent
    /// per version id: re-recording an existing version is a no-op, so a
    /// committer retrying after a partial failure converges.
    fn set_state(&self, bytes: &[u8], version: TxnId) -> Result<(), StmError>;

    /// Retained version ids, ascending.
    fn versions(&self) -> Result<Vec<TxnId>, StmError>;

    /// Drop a single version entry. Used by the lazy cleanup of entries
    /// whose transaction is durably dead.
    fn remove_state(&self, version: TxnId) -> Result<(), StmError>;

    /// Tear down all backing storage for this ref.
    fn destroy_state(&self) -> Result<(), StmError>;
}

/// Coordinator-backed container: one child node per retained version
/// under the ref's history directory, named by the zero-padded
/// transaction id.
pub struct CoordinatorContainer {
    coord: Arc<dyn Coordinator>,
    dir: String,
    retention: usize,
}

impl CoordinatorContainer {
    pub fn new(coord: Arc<dyn Coordinator>, history_dir: String, retention: usize) -> Self {
        Self {
            coord,
            dir: history_dir,
            retention: retention.max(1),
        }
    }

    fn version_path(&self, version: TxnId) -> String {
        format!("{}/{}", self.dir, version.version_name())
    }

    fn prune(&self) -> Result<(), StmError> {
        let mut ids = self.versions()?;
        while ids.len() > self.retention {
            let oldest = ids.remove(0);
            match self.coord.delete(&self.version_path(oldest), None) {
                // concurrent pruner got there first
                Ok(()) | Err(CoordError::NoNode { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl StateContainer for CoordinatorContainer {
    fn init_state(&self) -> Result<(), StmError> {
        match self.coord.create(&self.dir, &[], CreateMode::Persistent) {
            Ok(_) | Err(CoordError::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_state(&self, version: TxnId) -> Result<Vec<u8>, StmError> {
        match self.coord.get(&self.version_path(version)) {
            Ok((bytes, _)) => Ok(bytes),
            Err(CoordError::NoNode { .. }) => Err(StmError::StaleRead { version }),
            Err(e) => Err(e.into()),
        }
    }

    fn set_state(&self, bytes: &[u8], version: TxnId) -> Result<(), StmError> {
        match self
            .coord
            .create(&self.version_path(version), bytes, CreateMode::Persistent)
        {
            Ok(_) => {}
            // idempotent per version id
            Err(CoordError::NodeExists { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.prune()
    }

    fn versions(&self) -> Result<Vec<TxnId>, StmError> {
        let mut ids: Vec<TxnId> = self
            .coord
            .children(&self.dir)?
            .iter()
            .filter_map(|name| TxnId::parse_suffix(name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn remove_state(&self, version: TxnId) -> Result<(), StmError> {
        match self.coord.delete(&self.version_path(version), None) {
            Ok(()) | Err(CoordError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn destroy_state(&self) -> Result<(), StmError> {
        self.coord.delete_recursive(&self.dir)?;
        Ok(())
    }
}

/// Process-wide backing for [`LocalContainer`]s, keyed by ref path so
/// that every handle to the same name within one process shares history.
pub struct LocalStore {
    chains: DashMap<String, Arc<Mutex<BTreeMap<TxnId, Vec<u8>>>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    pub fn container(&self, key: &str, retention: usize) -> LocalContainer {
        let chain = self
            .chains
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BTreeMap::new())))
            .clone();
        LocalContainer {
            chain,
            retention: retention.max(1),
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Node-local container: an in-process version chain. Same contract as
/// the coordinator-backed store, minus distribution.
pub struct LocalContainer {
    chain: Arc<Mutex<BTreeMap<TxnId, Vec<u8>>>>,
    retention: usize,
}

impl StateContainer for LocalContainer {
    fn init_state(&self) -> Result<(), StmError> {
        Ok(())
    }

    fn get_state(&self, version: TxnId) -> Result<Vec<u8>, StmError> {
        self.chain
            .lock()
            .get(&version)
            .cloned()
            .ok_or(StmError::StaleRead { version })
    }

    fn set_state(&self, bytes: &[u8], version: TxnId) -> Result<(), StmError> {
        let mut chain = self.chain.lock();
        chain.entry(version).or_insert_with(|| bytes.to_vec());
        while chain.len() > self.retention {
            let oldest = *chain.keys().next().unwrap();
            chain.remove(&oldest);
        }
        Ok(())
    }

    fn versions(&self) -> Result<Vec<TxnId>, StmError> {
        Ok(self.chain.lock().keys().copied().collect())
    }

    fn remove_state(&self, version: TxnId) -> Result<(), StmError> {
        self.chain.lock().remove(&version);
        Ok(())
    }

    fn destroy_state(&self) -> Result<(), StmError> {
        self.chain.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_chain_set_get_prune() {
        let store = LocalStore::new();
        let c = store.container("/stm/refs/x/history", 2);
        c.set_state(b"a", TxnId(1)).unwrap();
        c.set_state(b"b", TxnId(2)).unwrap();
        c.set_state(b"c", TxnId(3)).unwrap();

        assert_eq!(c.versions().unwrap(), vec![TxnId(2), TxnId(3)]);
        assert_eq!(c.get_state(TxnId(3)).unwrap(), b"c");
        assert!(matches!(
            c.get_state(TxnId(1)),
            Err(StmError::StaleRead { version: TxnId(1) })
        ));
    }

    #[test]
    fn local_set_is_idempotent_per_version() {
        let store = LocalStore::new();
        let c = store.container("/k", 4);
        c.set_state(b"first", TxnId(5)).unwrap();
        c.set_state(b"second", TxnId(5)).unwrap();
        assert_eq!(c.get_state(TxnId(5)).unwrap(), b"first");
    }

    #[test]
    fn handles_share_history_by_key() {
        let store = LocalStore::new();
        let a = store.container("/k", 4);
        let b = store.container("/k", 4);
        a.set_state(b"v", TxnId(1)).unwrap();
        assert_eq!(b.get_state(TxnId(1)).unwrap(), b"v");
    }

    #[test]
    fn coordinator_chain_round_trip() {
        let cluster = petek::MemoryCluster::new();
        let coord: Arc<dyn Coordinator> = Arc::new(cluster.session());
        for p in ["/stm", "/stm/refs", "/stm/refs/x"] {
            coord.create(p, &[], CreateMode::Persistent).unwrap();
        }
        let c = CoordinatorContainer::new(coord, "/stm/refs/x/history".to_string(), 2);
        c.init_state().unwrap();
        c.init_state().unwrap(); // idempotent

        c.set_state(b"a", TxnId(1)).unwrap();
        c.set_state(b"b", TxnId(2)).unwrap();
        c.set_state(b"c", TxnId(3)).unwrap();
        assert_eq!(c.versions().unwrap(), vec![TxnId(2), TxnId(3)]);
        assert!(matches!(
            c.get_state(TxnId(1)),
            Err(StmError::StaleRead { .. })
        ));
        assert_eq!(c.get_state(TxnId(2)).unwrap(), b"b");

        c.destroy_state().unwrap();
        assert!(c.versions().is_err());
    }
}
