use crate::error::CoordError;
use crate::path;
use std::time::Instant;

/// Node creation flavor.
///
/// Sequential modes append a per-parent, zero-padded monotonic counter to
/// the supplied name, so lexicographic child order equals creation order.
/// Ephemeral nodes are tied to the creating session and vanish with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    #[inline]
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    #[inline]
    pub fn is_ephemeral(self) -> bool {
        matches!(
            self,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential
        )
    }
}

/// A session-bound handle to the coordination service.
///
/// One implementor per backing service; the in-process implementation is
/// [`MemoryCluster`](crate::MemoryCluster). All operations are
/// linearizable with respect to each other.
///
/// Every node carries `(data, version)`; `version` starts at 0 and
/// increments on each data write, serving as the token for conditional
/// writes and deletes.
pub trait Coordinator: Send + Sync {
    /// Create a node. For sequential modes the returned path carries the
    /// assigned counter suffix; otherwise it echoes `path`.
    fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordError>;

    /// Read a node's data and current data version.
    fn get(&self, path: &str) -> Result<(Vec<u8>, i64), CoordError>;

    /// Write a node's data. With `expected = Some(v)` the write succeeds
    /// only if the current version is `v` (compare-and-set); `None`
    /// writes unconditionally. Returns the new version.
    fn set(&self, path: &str, data: &[u8], expected: Option<i64>) -> Result<i64, CoordError>;

    /// Delete a leaf node, optionally conditioned on its data version.
    fn delete(&self, path: &str, expected: Option<i64>) -> Result<(), CoordError>;

    /// Whether a node exists.
    fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Child names of a node. Order is unspecified.
    fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// Block until the node at `path` no longer exists, or `deadline`
    /// passes ([`CoordError::Timeout`]). Returns immediately if the node
    /// is already gone. This is the watch primitive lock recipes queue on.
    fn wait_deleted(&self, path: &str, deadline: Instant) -> Result<(), CoordError>;

    /// Delete a whole subtree, tolerating concurrent deletions.
    fn delete_recursive(&self, p: &str) -> Result<(), CoordError> {
        let kids = match self.children(p) {
            Ok(kids) => kids,
            Err(CoordError::NoNode { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for kid in kids {
            self.delete_recursive(&path::join(p, &kid))?;
        }
        match self.delete(p, None) {
            Ok(()) | Err(CoordError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
