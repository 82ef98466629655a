//! In-process coordinator with full session semantics.
//!
//! One lock around the whole tree makes every operation trivially
//! linearizable. Deletions (including session expiry sweeping ephemerals)
//! signal a condvar so `wait_deleted` callers wake promptly.

use crate::coordinator::{Coordinator, CreateMode};
use crate::error::CoordError;
use crate::path;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

struct NodeRec {
    data: Vec<u8>,
    version: i64,
    /// Owning session id for ephemerals.
    ephemeral_owner: Option<u64>,
    /// Counter handed out to sequential children.
    next_seq: u64,
    children: BTreeSet<String>,
}

impl NodeRec {
    fn new(data: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            next_seq: 0,
            children: BTreeSet::new(),
        }
    }
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<String, NodeRec>,
}

struct Shared {
    tree: Mutex<Tree>,
    deletions: Condvar,
    next_session: AtomicU64,
}

/// A single-process coordination service.
///
/// Hand every client a [`MemorySession`] via [`MemoryCluster::session`];
/// sessions share one tree and observe each other's writes, ephemerals,
/// and deletions exactly as separate processes would against a real
/// coordinator.
pub struct MemoryCluster {
    shared: Arc<Shared>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert("/".to_string(), NodeRec::new(Vec::new(), None));
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(tree),
                deletions: Condvar::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session against this cluster.
    pub fn session(&self) -> MemorySession {
        MemorySession {
            shared: self.shared.clone(),
            id: self.shared.next_session.fetch_add(1, Ordering::SeqCst),
            alive: AtomicBool::new(true),
        }
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session. Dropping or expiring it removes every ephemeral
/// node it created and wakes any waiter parked on those paths.
pub struct MemorySession {
    shared: Arc<Shared>,
    id: u64,
    alive: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Kill the session: its ephemerals vanish and every subsequent call
    /// through this handle fails with [`CoordError::SessionExpired`].
    /// Idempotent.
    pub fn expire(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let mut tree = self.shared.tree.lock();
            let owned: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, n)| n.ephemeral_owner == Some(self.id))
                .map(|(p, _)| p.clone())
                .collect();
            for p in &owned {
                remove_node(&mut tree, p);
            }
            drop(tree);
            if !owned.is_empty() {
                tracing::debug!(session = self.id, nodes = owned.len(), "ephemerals swept");
            }
            self.shared.deletions.notify_all();
        }
    }

    fn check_alive(&self) -> Result<(), CoordError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(CoordError::SessionExpired)
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.expire();
    }
}

fn remove_node(tree: &mut Tree, p: &str) {
    if tree.nodes.remove(p).is_some() {
        if let Some(parent) = path::parent(p) {
            if let Some(rec) = tree.nodes.get_mut(parent) {
                rec.children.remove(path::last_segment(p));
            }
        }
    }
}

impl Coordinator for MemorySession {
    fn create(&self, p: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordError> {
        self.check_alive()?;
        path::validate(p)?;
        if p == "/" {
            return Err(CoordError::NodeExists {
                path: p.to_string(),
            });
        }
        let parent = path::parent(p)
            .ok_or_else(|| CoordError::BadPath {
                path: p.to_string(),
            })?
            .to_string();

        let mut tree = self.shared.tree.lock();
        let final_path = {
            let parent_rec = tree
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| CoordError::NoNode {
                    path: parent.clone(),
                })?;
            if mode.is_sequential() {
                let seq = parent_rec.next_seq;
                parent_rec.next_seq += 1;
                format!("{p}{seq:010}")
            } else {
                p.to_string()
            }
        };
        if tree.nodes.contains_key(&final_path) {
            return Err(CoordError::NodeExists { path: final_path });
        }
        let owner = mode.is_ephemeral().then_some(self.id);
        tree.nodes
            .insert(final_path.clone(), NodeRec::new(data.to_vec(), owner));
        let name = path::last_segment(&final_path).to_string();
        tree.nodes.get_mut(&parent).unwrap().children.insert(name);
        Ok(final_path)
    }

    fn get(&self, p: &str) -> Result<(Vec<u8>, i64), CoordError> {
        self.check_alive()?;
        let tree = self.shared.tree.lock();
        let rec = tree.nodes.get(p).ok_or_else(|| CoordError::NoNode {
            path: p.to_string(),
        })?;
        Ok((rec.data.clone(), rec.version))
    }

    fn set(&self, p: &str, data: &[u8], expected: Option<i64>) -> Result<i64, CoordError> {
        self.check_alive()?;
        let mut tree = self.shared.tree.lock();
        let rec = tree.nodes.get_mut(p).ok_or_else(|| CoordError::NoNode {
            path: p.to_string(),
        })?;
        if let Some(exp) = expected {
            if rec.version != exp {
                return Err(CoordError::BadVersion {
                    path: p.to_string(),
                    expected: exp,
                    actual: rec.version,
                });
            }
        }
        rec.data = data.to_vec();
        rec.version += 1;
        Ok(rec.version)
    }

    fn delete(&self, p: &str, expected: Option<i64>) -> Result<(), CoordError> {
        self.check_alive()?;
        if p == "/" {
            return Err(CoordError::BadPath {
                path: p.to_string(),
            });
        }
        let mut tree = self.shared.tree.lock();
        let rec = tree.nodes.get(p).ok_or_else(|| CoordError::NoNode {
            path: p.to_string(),
        })?;
        if !rec.children.is_empty() {
            return Err(CoordError::NotEmpty {
                path: p.to_string(),
            });
        }
        if let Some(exp) = expected {
            if rec.version != exp {
                return Err(CoordError::BadVersion {
                    path: p.to_string(),
                    expected: exp,
                    actual: rec.version,
                });
            }
        }
        remove_node(&mut tree, p);
        drop(tree);
        self.shared.deletions.notify_all();
        Ok(())
    }

    fn exists(&self, p: &str) -> Result<bool, CoordError> {
        self.check_alive()?;
        Ok(self.shared.tree.lock().nodes.contains_key(p))
    }

    fn children(&self, p: &str) -> Result<Vec<String>, CoordError> {
        self.check_alive()?;
        let tree = self.shared.tree.lock();
        let rec = tree.nodes.get(p).ok_or_else(|| CoordError::NoNode {
            path: p.to_string(),
        })?;
        Ok(rec.children.iter().cloned().collect())
    }

    fn wait_deleted(&self, p: &str, deadline: Instant) -> Result<(), CoordError> {
        self.check_alive()?;
        let mut tree = self.shared.tree.lock();
        loop {
            if !tree.nodes.contains_key(p) {
                return Ok(());
            }
            self.check_alive()?;
            if Instant::now() >= deadline {
                return Err(CoordError::Timeout);
            }
            self.shared.deletions.wait_until(&mut tree, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> MemorySession {
        MemoryCluster::new().session()
    }

    #[test]
    fn create_get_set_delete() {
        let s = session();
        s.create("/a", b"one", CreateMode::Persistent).unwrap();
        assert_eq!(s.get("/a").unwrap(), (b"one".to_vec(), 0));

        let v = s.set("/a", b"two", None).unwrap();
        assert_eq!(v, 1);
        assert_eq!(s.get("/a").unwrap(), (b"two".to_vec(), 1));

        s.delete("/a", None).unwrap();
        assert!(!s.exists("/a").unwrap());
    }

    #[test]
    fn conditional_writes() {
        let s = session();
        s.create("/a", b"x", CreateMode::Persistent).unwrap();
        assert!(matches!(
            s.set("/a", b"y", Some(7)),
            Err(CoordError::BadVersion { .. })
        ));
        s.set("/a", b"y", Some(0)).unwrap();
        assert!(matches!(
            s.set("/a", b"z", Some(0)),
            Err(CoordError::BadVersion { .. })
        ));
    }

    #[test]
    fn create_requires_parent() {
        let s = session();
        assert!(matches!(
            s.create("/a/b", b"", CreateMode::Persistent),
            Err(CoordError::NoNode { .. })
        ));
    }

    #[test]
    fn delete_refuses_non_leaf() {
        let s = session();
        s.create("/a", b"", CreateMode::Persistent).unwrap();
        s.create("/a/b", b"", CreateMode::Persistent).unwrap();
        assert!(matches!(
            s.delete("/a", None),
            Err(CoordError::NotEmpty { .. })
        ));
        s.delete_recursive("/a").unwrap();
        assert!(!s.exists("/a").unwrap());
    }

    #[test]
    fn sequential_names_are_ordered() {
        let s = session();
        s.create("/q", b"", CreateMode::Persistent).unwrap();
        let a = s
            .create("/q/n-", b"", CreateMode::PersistentSequential)
            .unwrap();
        let b = s
            .create("/q/n-", b"", CreateMode::PersistentSequential)
            .unwrap();
        assert_eq!(a, "/q/n-0000000000");
        assert_eq!(b, "/q/n-0000000001");
        assert!(a < b);
        // mixed prefixes share the parent counter
        let c = s
            .create("/q/m-", b"", CreateMode::EphemeralSequential)
            .unwrap();
        assert_eq!(c, "/q/m-0000000002");
    }

    #[test]
    fn expiry_sweeps_ephemerals_only() {
        let cluster = MemoryCluster::new();
        let a = cluster.session();
        let b = cluster.session();
        a.create("/p", b"", CreateMode::Persistent).unwrap();
        a.create("/p/eph", b"", CreateMode::Ephemeral).unwrap();
        b.create("/p/other", b"", CreateMode::Ephemeral).unwrap();

        a.expire();
        assert!(matches!(s_err(&a), CoordError::SessionExpired));
        assert!(b.exists("/p").unwrap());
        assert!(!b.exists("/p/eph").unwrap());
        assert!(b.exists("/p/other").unwrap());
    }

    fn s_err(s: &MemorySession) -> CoordError {
        s.exists("/p").unwrap_err()
    }

    #[test]
    fn wait_deleted_returns_for_missing_node() {
        let s = session();
        s.wait_deleted("/nope", Instant::now() + std::time::Duration::from_millis(10))
            .unwrap();
    }

    #[test]
    fn wait_deleted_times_out() {
        let s = session();
        s.create("/held", b"", CreateMode::Persistent).unwrap();
        let err = s
            .wait_deleted("/held", Instant::now() + std::time::Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err, CoordError::Timeout);
    }
}
