//! The transaction protocol.
//!
//! Each attempt draws two ids from the coordinator's sequential counter:
//! the attempt id at entry, which anchors every read (the read point),
//! and a commit point drawn after the writer locks are held, which tags
//! every version the attempt writes. The split matters: a commit point
//! is always newer than any attempt that was already running, so a
//! concurrent committer can never slip a version underneath someone
//! else's read point.
//!
//! Commit walks the write-set in lexicographic path order (deadlock-free
//! lock acquisition), re-validates the read-set, runs validators,
//! publishes `Committing`, writes the new versions tagged with the
//! commit point, then publishes `Committed` on the commit-point node.
//! Readers resolve the tagging node's durable state before trusting a
//! version entry, so a committer dying between those steps leaves
//! nothing visible.

use crate::client::ClientInner;
use crate::codec;
use crate::errors::StmError;
use crate::lock::LockGuard;
use crate::refs::{Ref, RefState};
use crate::txn::{TxnId, TxnState};
use petek::{CoordError, CreateMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

struct ReadEntry {
    state: Arc<RefState>,
    version: TxnId,
    bytes: Vec<u8>,
}

struct WriteEntry {
    state: Arc<RefState>,
    bytes: Vec<u8>,
}

/// One transactional attempt. Obtained from
/// [`StmClient::atomically`](crate::StmClient::atomically), which re-runs
/// the block with a fresh `Transaction` on conflict.
pub struct Transaction {
    client: Arc<ClientInner>,
    id: TxnId,
    node: String,
    /// Allocated under the writer locks; tags this attempt's versions.
    commit_point: Option<(TxnId, String)>,
    local_state: TxnState,
    /// Ref path -> observed version and bytes. Doubles as the per-ref
    /// point-in-time cache: repeated loads return the same value.
    read_set: HashMap<String, ReadEntry>,
    /// Ref path -> pending bytes. BTreeMap gives the deterministic lock
    /// acquisition order.
    write_set: BTreeMap<String, WriteEntry>,
    commit_hooks: Vec<Box<dyn FnOnce() + Send>>,
    rollback_hooks: Vec<Box<dyn FnOnce() + Send>>,
    deadline: Instant,
}

impl Transaction {
    pub(crate) fn begin(client: Arc<ClientInner>, deadline: Instant) -> Result<Self, StmError> {
        let node = client.coord.create(
            &client.layout.txn_prefix(),
            &[TxnState::Running.as_byte()],
            CreateMode::PersistentSequential,
        )?;
        let id = TxnId::parse_suffix(&node).ok_or_else(|| {
            StmError::Coordinator(CoordError::BadPath { path: node.clone() })
        })?;
        Ok(Self {
            client,
            id,
            node,
            commit_point: None,
            local_state: TxnState::Running,
            read_set: HashMap::new(),
            write_set: BTreeMap::new(),
            commit_hooks: Vec::new(),
            rollback_hooks: Vec::new(),
            deadline,
        })
    }

    /// This attempt's transaction id, which is also its read point.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Read a ref at this transaction's read point.
    ///
    /// Pending writes win (read-your-own-writes), then the per-ref cache,
    /// then the newest committed version at or below the read point. A
    /// ref born after the read point signals [`StmError::Retry`].
    pub fn load<T: Serialize + DeserializeOwned>(&mut self, r: &Ref<T>) -> Result<T, StmError> {
        let bytes = self.load_bytes(&r.state)?;
        codec::decode(&bytes)
    }

    /// Stage a new value for a ref. Nothing reaches the coordinator
    /// until commit.
    pub fn store<T: Serialize>(&mut self, r: &Ref<T>, value: T) -> Result<(), StmError> {
        let bytes = codec::encode(&value)?;
        self.store_bytes(r.state.clone(), bytes)
    }

    /// Read-modify-write: stage `f(current)` and return it.
    pub fn alter<T, F>(&mut self, r: &Ref<T>, f: F) -> Result<T, StmError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        let current = self.load(r)?;
        let next = f(current);
        let bytes = codec::encode(&next)?;
        self.store_bytes(r.state.clone(), bytes)?;
        Ok(next)
    }

    /// Commute a ref. True commute semantics (re-applying `f` at commit
    /// without conflict checking) are intentionally not provided: this is
    /// an alias for [`alter`](Transaction::alter).
    pub fn commute<T, F>(&mut self, r: &Ref<T>, f: F) -> Result<T, StmError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(T) -> T,
    {
        self.alter(r, f)
    }

    /// Run a side effect after this transaction commits, off the lock
    /// path.
    pub fn on_commit<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.commit_hooks.push(Box::new(f));
    }

    /// Run a side effect if this attempt aborts or retries.
    pub fn on_rollback<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.rollback_hooks.push(Box::new(f));
    }

    fn ensure_running(&self) -> Result<(), StmError> {
        if self.local_state == TxnState::Running {
            Ok(())
        } else {
            Err(StmError::NoActiveTransaction)
        }
    }

    fn load_bytes(&mut self, rs: &Arc<RefState>) -> Result<Vec<u8>, StmError> {
        self.ensure_running()?;
        if let Some(w) = self.write_set.get(&rs.path) {
            return Ok(w.bytes.clone());
        }
        if let Some(r) = self.read_set.get(&rs.path) {
            return Ok(r.bytes.clone());
        }

        let guard = rs.lock.read(self.deadline)?;
        let found = self
            .client
            .latest_committed(rs.container.as_ref(), self.id);
        let _ = guard.unlock();

        match found? {
            Some((version, bytes)) => {
                self.read_set.insert(
                    rs.path.clone(),
                    ReadEntry {
                        state: rs.clone(),
                        version,
                        bytes: bytes.clone(),
                    },
                );
                Ok(bytes)
            }
            None => {
                let retained = rs.container.versions()?;
                if !retained.is_empty()
                    && retained.len() >= self.client.config.history_retention
                {
                    // the version we needed has been pruned away
                    Err(StmError::StaleRead {
                        version: self.id,
                    })
                } else {
                    // ref created after our read point
                    Err(StmError::Retry)
                }
            }
        }
    }

    pub(crate) fn store_bytes(
        &mut self,
        state: Arc<RefState>,
        bytes: Vec<u8>,
    ) -> Result<(), StmError> {
        self.ensure_running()?;
        self.write_set
            .insert(state.path.clone(), WriteEntry { state, bytes });
        Ok(())
    }

    /// Durably record a state transition on the transaction node.
    fn publish_state(&mut self, state: TxnState) -> Result<(), StmError> {
        self.client
            .coord
            .set(&self.node, &[state.as_byte()], None)?;
        self.local_state = state;
        Ok(())
    }

    /// Best-effort durable `Retry` mark between attempts.
    pub(crate) fn mark_retry(&mut self) {
        if self.local_state.is_terminal() {
            return;
        }
        if let Err(e) = self.publish_state(TxnState::Retry) {
            tracing::debug!(id = %self.id, error = %e, "retry mark failed");
        }
        self.local_state = TxnState::Retry;
    }

    /// Best-effort durable `Aborted` mark; terminal. Also retires the
    /// commit point if one was allocated, so any version entry written
    /// under it becomes durably dead and cleanable.
    pub(crate) fn mark_aborted(&mut self) {
        if self.local_state.is_terminal() {
            return;
        }
        if let Some((cp, cp_node)) = &self.commit_point {
            if let Err(e) = self
                .client
                .coord
                .set(cp_node, &[TxnState::Aborted.as_byte()], None)
            {
                tracing::debug!(commit_point = %cp, error = %e, "commit point abort mark failed");
            }
        }
        if let Err(e) = self.publish_state(TxnState::Aborted) {
            tracing::debug!(id = %self.id, error = %e, "abort mark failed");
        }
        self.local_state = TxnState::Aborted;
    }

    pub(crate) fn commit(&mut self) -> Result<(), StmError> {
        self.ensure_running()?;
        if Instant::now() >= self.deadline {
            self.mark_aborted();
            return Err(StmError::Timeout);
        }

        let write_set = std::mem::take(&mut self.write_set);

        // read-only fast path: nothing to lock, nothing to verify beyond
        // what load already anchored
        if write_set.is_empty() {
            self.publish_state(TxnState::Committed)?;
            self.run_commit_hooks();
            return Ok(());
        }

        // 1. writer locks in lexicographic path order
        let mut guards: Vec<LockGuard> = Vec::with_capacity(write_set.len());
        for entry in write_set.values() {
            match entry.state.lock.write(self.deadline) {
                Ok(g) => guards.push(g),
                Err(e) => {
                    self.mark_aborted();
                    return Err(e);
                }
            }
        }

        // 2. write-write conflicts: anything committed past our read
        // point on a ref we are about to overwrite forces a retry, which
        // also keeps version tags strictly increasing per ref. The same
        // pass captures the pre-commit values for watch dispatch.
        let mut olds: HashMap<String, Vec<u8>> = HashMap::new();
        for (path, entry) in &write_set {
            let latest = self
                .client
                .latest_committed(entry.state.container.as_ref(), TxnId::MAX)?;
            if let Some((latest_id, bytes)) = latest {
                if latest_id > self.id {
                    tracing::debug!(
                        id = %self.id, ref_path = %path, committer = %latest_id,
                        "write-write conflict"
                    );
                    drop(guards);
                    return Err(StmError::Retry);
                }
                olds.insert(path.clone(), bytes);
            }
        }

        // 3. read-set re-validation. Written refs are already covered by
        // the stricter check above. A newer committer with byte-identical
        // state does not invalidate the read.
        for (path, re) in &self.read_set {
            if write_set.contains_key(path) {
                continue;
            }
            let latest = self
                .client
                .latest_committed(re.state.container.as_ref(), TxnId::MAX)?;
            match latest {
                Some((latest_id, latest_bytes)) => {
                    if latest_id > self.id && latest_bytes != re.bytes {
                        tracing::debug!(
                            id = %self.id, ref_path = %path, observed = %re.version,
                            committer = %latest_id, "read-set conflict"
                        );
                        drop(guards);
                        return Err(StmError::Retry);
                    }
                }
                // observed history vanished underneath us
                None => {
                    drop(guards);
                    return Err(StmError::Retry);
                }
            }
        }

        // 4. validators, against the prospective values
        for entry in write_set.values() {
            if !entry.state.run_validator(&entry.bytes)? {
                drop(guards);
                self.mark_aborted();
                return Err(StmError::ValidatorFailure {
                    name: entry.state.name.clone(),
                });
            }
        }

        // 5. publish intent, then draw the commit point that will tag
        // every version below. Allocated under the locks, so per ref the
        // tags of successive committers strictly increase, and a commit
        // point is always newer than any concurrently running attempt's
        // read point.
        self.publish_state(TxnState::Committing)?;
        let cp_node = match self.client.coord.create(
            &self.client.layout.txn_prefix(),
            &[TxnState::Committing.as_byte()],
            CreateMode::PersistentSequential,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.mark_aborted();
                return Err(e.into());
            }
        };
        let cp = match TxnId::parse_suffix(&cp_node) {
            Some(cp) => cp,
            None => {
                self.mark_aborted();
                return Err(StmError::Coordinator(CoordError::BadPath {
                    path: cp_node,
                }));
            }
        };
        self.commit_point = Some((cp, cp_node.clone()));

        // 6. write the new versions, tagging each ref with the in-flight
        // writer marker while its entry lands
        for entry in write_set.values() {
            let marker_path = format!("{}/{}", entry.state.txn_dir, cp.node_name());
            let marker = match self
                .client
                .coord
                .create(&marker_path, &[], CreateMode::Ephemeral)
            {
                Ok(p) => Some(p),
                Err(CoordError::NodeExists { .. }) => None,
                Err(e) => {
                    self.mark_aborted();
                    return Err(e.into());
                }
            };
            let written = entry.state.container.set_state(&entry.bytes, cp);
            if let Some(m) = marker {
                let _ = self.client.coord.delete(&m, None);
            }
            if let Err(e) = written {
                // partially written entries stay invisible: the commit
                // point never reaches Committed
                self.mark_aborted();
                return Err(e);
            }
        }

        // 7. the atomic visibility flip: first on the commit point, which
        // readers resolve against, then on the attempt node
        self.client
            .coord
            .set(&cp_node, &[TxnState::Committed.as_byte()], None)?;
        self.publish_state(TxnState::Committed)?;

        // 8. unlock, then fire watches off-thread
        for g in guards {
            if let Err(e) = g.unlock() {
                tracing::debug!(id = %self.id, error = %e, "writer unlock failed");
            }
        }
        for (path, entry) in &write_set {
            if let Some(old) = olds.remove(path) {
                self.client.watcher.notify(
                    entry.state.watchers_snapshot(),
                    old,
                    entry.bytes.clone(),
                );
            }
        }
        self.run_commit_hooks();
        Ok(())
    }

    fn run_commit_hooks(&mut self) {
        for hook in std::mem::take(&mut self.commit_hooks) {
            hook();
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.local_state != TxnState::Committed {
            for hook in std::mem::take(&mut self.rollback_hooks) {
                hook();
            }
        }
    }
}
