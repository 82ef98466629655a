//! Distributed fair read/write lock.
//!
//! The classic coordinator recipe: queue as an ephemeral sequential child
//! of the ref's lock directory, then wait on the node immediately ahead.
//!
//! - a writer holds the lock once no child of any kind has a lower
//!   sequence;
//! - a reader proceeds once no *write* child has a lower sequence, so
//!   readers run in parallel;
//! - deleting the own node releases; session loss releases implicitly
//!   because the queue nodes are ephemeral.
//!
//! Waiting on the single predecessor (rather than the queue head) keeps
//! wakeups FIFO without thundering herds.

use crate::errors::StmError;
use petek::{CoordError, Coordinator, CreateMode};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Read,
    Write,
}

impl LockKind {
    fn prefix(self) -> &'static str {
        match self {
            LockKind::Read => "read-",
            LockKind::Write => "write-",
        }
    }
}

struct QueueEntry {
    seq: u64,
    kind: LockKind,
    name: String,
}

/// Numeric suffix the coordinator appended to a queue node name.
fn parse_seq(name: &str) -> Option<u64> {
    name.rsplit('-').next()?.parse().ok()
}

pub(crate) struct DistLock {
    coord: Arc<dyn Coordinator>,
    dir: String,
    /// Client identity baked into queue node names, for operability when
    /// inspecting a wedged queue.
    owner: String,
}

impl DistLock {
    pub fn new(coord: Arc<dyn Coordinator>, dir: String, owner: String) -> Self {
        Self { coord, dir, owner }
    }

    pub fn read(&self, deadline: Instant) -> Result<LockGuard, StmError> {
        self.acquire(LockKind::Read, deadline)
    }

    pub fn write(&self, deadline: Instant) -> Result<LockGuard, StmError> {
        self.acquire(LockKind::Write, deadline)
    }

    fn acquire(&self, kind: LockKind, deadline: Instant) -> Result<LockGuard, StmError> {
        let prefix = format!("{}/{}{}-", self.dir, kind.prefix(), self.owner);
        let own_path = self
            .coord
            .create(&prefix, &[], CreateMode::EphemeralSequential)?;
        let own_seq = match parse_seq(&own_path) {
            Some(seq) => seq,
            None => {
                let _ = self.coord.delete(&own_path, None);
                return Err(StmError::Coordinator(CoordError::BadPath {
                    path: own_path,
                }));
            }
        };

        loop {
            let mut queue = self.queue()?;
            queue.retain(|e| e.seq < own_seq);
            let blocker = match kind {
                LockKind::Write => queue.last(),
                LockKind::Read => queue.iter().rev().find(|e| e.kind == LockKind::Write),
            };
            let Some(blocker) = blocker else {
                return Ok(LockGuard {
                    coord: self.coord.clone(),
                    node: own_path,
                    released: false,
                });
            };
            let blocker_path = format!("{}/{}", self.dir, blocker.name);
            match self.coord.wait_deleted(&blocker_path, deadline) {
                Ok(()) => continue,
                Err(e) => {
                    // leave the queue before giving up, or we would block
                    // everyone behind us until session loss
                    let _ = self.coord.delete(&own_path, None);
                    return Err(e.into());
                }
            }
        }
    }

    fn queue(&self) -> Result<Vec<QueueEntry>, StmError> {
        let mut entries: Vec<QueueEntry> = self
            .coord
            .children(&self.dir)?
            .into_iter()
            .filter_map(|name| {
                let kind = if name.starts_with("write-") {
                    LockKind::Write
                } else if name.starts_with("read-") {
                    LockKind::Read
                } else {
                    return None;
                };
                parse_seq(&name).map(|seq| QueueEntry { seq, kind, name })
            })
            .collect();
        entries.sort_unstable_by_key(|e| e.seq);
        Ok(entries)
    }
}

/// Held queue position. Explicit [`unlock`](LockGuard::unlock) in the
/// happy path; Drop is the best-effort backstop.
pub(crate) struct LockGuard {
    coord: Arc<dyn Coordinator>,
    node: String,
    released: bool,
}

impl LockGuard {
    pub fn unlock(mut self) -> Result<(), StmError> {
        self.released = true;
        match self.coord.delete(&self.node, None) {
            Ok(()) | Err(CoordError::NoNode { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.coord.delete(&self.node, None) {
                tracing::debug!(node = %self.node, error = %e, "lock release on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petek::MemoryCluster;
    use std::time::Duration;

    #[test]
    fn parse_queue_names() {
        assert_eq!(parse_seq("write-ab12cd-0000000007"), Some(7));
        assert_eq!(parse_seq("read-ab12cd-0000000131"), Some(131));
        assert_eq!(parse_seq("garbage"), None);
    }

    #[test]
    fn writer_then_writer_queues_fifo() {
        let cluster = MemoryCluster::new();
        let coord: Arc<dyn Coordinator> = Arc::new(cluster.session());
        coord.create("/l", &[], CreateMode::Persistent).unwrap();
        let lock = DistLock::new(coord.clone(), "/l".to_string(), "me".to_string());

        let deadline = Instant::now() + Duration::from_millis(200);
        let first = lock.write(deadline).unwrap();
        // second writer cannot get in while the first holds the lock
        let second = lock.write(Instant::now() + Duration::from_millis(50));
        assert!(matches!(second, Err(StmError::Timeout)));
        // a timed-out waiter leaves the queue
        assert_eq!(coord.children("/l").unwrap().len(), 1);

        first.unlock().unwrap();
        lock.write(Instant::now() + Duration::from_millis(200))
            .unwrap()
            .unlock()
            .unwrap();
    }

    #[test]
    fn readers_share_writers_exclude() {
        let cluster = MemoryCluster::new();
        let coord: Arc<dyn Coordinator> = Arc::new(cluster.session());
        coord.create("/l", &[], CreateMode::Persistent).unwrap();
        let lock = DistLock::new(coord.clone(), "/l".to_string(), "me".to_string());

        let r1 = lock.read(Instant::now() + Duration::from_millis(200)).unwrap();
        let r2 = lock.read(Instant::now() + Duration::from_millis(200)).unwrap();
        // both readers in simultaneously
        assert_eq!(coord.children("/l").unwrap().len(), 2);

        let w = lock.write(Instant::now() + Duration::from_millis(50));
        assert!(matches!(w, Err(StmError::Timeout)));

        r1.unlock().unwrap();
        r2.unlock().unwrap();
        lock.write(Instant::now() + Duration::from_millis(200))
            .unwrap()
            .unlock()
            .unwrap();
    }
}
