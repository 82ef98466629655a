//! Client facade.
//!
//! An [`StmClient`] binds one coordinator session to an STM root:
//! subtree initialization, ref and atom construction, and the
//! transactional entry point [`StmClient::atomically`].

use crate::atom::{Atom, AtomState};
use crate::backoff::RetryBackoff;
use crate::codec;
use crate::config::StmConfig;
use crate::container::{CoordinatorContainer, LocalStore, StateContainer};
use crate::errors::StmError;
use crate::lock::DistLock;
use crate::refs::{Ref, RefState};
use crate::transaction::Transaction;
use crate::tree::{self, StmLayout};
use crate::txn::{TxnId, TxnState};
use crate::watch::WatcherHub;
use dashmap::DashMap;
use petek::{CoordError, Coordinator, CreateMode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Instant;

pub(crate) struct ClientInner {
    pub coord: Arc<dyn Coordinator>,
    pub config: StmConfig,
    pub layout: StmLayout,
    pub watcher: WatcherHub,
    /// Client identity baked into lock queue nodes.
    owner: String,
    /// Weak per-client registry: handles to the same ref name share one
    /// `RefState` (watchers, validator, container).
    refs: DashMap<String, Weak<RefState>>,
    /// Same for atoms.
    atoms: DashMap<String, Weak<AtomState>>,
    /// Backing for node-local refs.
    locals: LocalStore,
}

impl ClientInner {
    /// Newest version at or below `at_or_before` whose tagging
    /// transaction is durably `Committed`. Entries of transactions that
    /// are durably `Aborted` are removed along the way; entries still in
    /// flight are invisible and left alone.
    pub fn latest_committed(
        &self,
        container: &dyn StateContainer,
        at_or_before: TxnId,
    ) -> Result<Option<(TxnId, Vec<u8>)>, StmError> {
        let versions = container.versions()?;
        for id in versions.into_iter().rev() {
            if id > at_or_before {
                continue;
            }
            match self.txn_state_of(id)? {
                Some(TxnState::Committed) => match container.get_state(id) {
                    Ok(bytes) => return Ok(Some((id, bytes))),
                    // pruned between listing and fetch
                    Err(StmError::StaleRead { .. }) => continue,
                    Err(e) => return Err(e),
                },
                Some(TxnState::Aborted) => {
                    // lazy cleanup of a durably dead writer's entry
                    let _ = container.remove_state(id);
                }
                // Running / Retry / Committing, or unknown state: not
                // visible, and possibly about to commit, so left alone
                _ => {}
            }
        }
        Ok(None)
    }

    /// Durable state of a transaction, `None` if its node is gone or
    /// unreadable as a state byte.
    pub fn txn_state_of(&self, id: TxnId) -> Result<Option<TxnState>, StmError> {
        match self.coord.get(&self.layout.txn_node(id)) {
            Ok((data, _)) => Ok(data.first().copied().and_then(TxnState::from_byte)),
            Err(CoordError::NoNode { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_if_absent(&self, path: &str) -> Result<(), StmError> {
        match self.coord.create(path, &[], CreateMode::Persistent) {
            Ok(_) | Err(CoordError::NodeExists { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn destroy_ref(&self, state: &RefState) -> Result<(), StmError> {
        self.refs.remove(&state.path);
        state.container.destroy_state()?;
        self.coord.delete_recursive(&state.path)?;
        Ok(())
    }

    pub fn destroy_atom(&self, name: &str) -> Result<(), StmError> {
        self.atoms.remove(name);
        self.coord
            .delete_recursive(&self.layout.atom_root(name))?;
        Ok(())
    }
}

/// Handle to one STM rooted in one coordinator session.
///
/// Cheap to clone; all clones share the session, the config, and the
/// watcher thread.
#[derive(Clone)]
pub struct StmClient {
    inner: Arc<ClientInner>,
}

impl StmClient {
    /// Bind a coordinator session. Creates the STM subtree if this
    /// cluster has never hosted one under `config.stm_root`.
    pub fn connect(coord: Arc<dyn Coordinator>, config: StmConfig) -> Result<Self, StmError> {
        let layout = StmLayout::new(&config.stm_root);
        let client = Self {
            inner: Arc::new(ClientInner {
                coord,
                config,
                layout,
                watcher: WatcherHub::new(),
                owner: uuid::Uuid::new_v4().simple().to_string(),
                refs: DashMap::new(),
                atoms: DashMap::new(),
                locals: LocalStore::new(),
            }),
        };
        client.init_stm()?;
        Ok(client)
    }

    pub fn config(&self) -> &StmConfig {
        &self.inner.config
    }

    /// Idempotently materialize `{root}`, `/history`, `/refs`, `/atoms`.
    pub fn init_stm(&self) -> Result<(), StmError> {
        let l = &self.inner.layout;
        for path in [
            l.root().to_string(),
            l.history(),
            l.refs(),
            l.atoms(),
        ] {
            self.inner.create_if_absent(&path)?;
        }
        Ok(())
    }

    /// Delete and re-create the whole STM subtree. Every existing ref,
    /// atom, and transaction record is gone afterwards; intended for
    /// test harnesses only.
    pub fn reset_stm(&self) -> Result<(), StmError> {
        self.inner.refs.clear();
        self.inner.atoms.clear();
        self.inner
            .coord
            .delete_recursive(self.inner.layout.root())?;
        self.init_stm()
    }

    /// Handle to the named ref, materializing its subtree on first use.
    pub fn dref<T: Serialize + DeserializeOwned>(&self, name: &str) -> Result<Ref<T>, StmError> {
        let state = self.ref_state(name, Backend::Coordinator)?;
        Ok(Ref::from_state(state, self.inner.clone()))
    }

    /// Like [`dref`](StmClient::dref), seeding `init` through a one-shot
    /// transaction iff the ref has no committed history yet.
    pub fn dref_init<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        init: T,
    ) -> Result<Ref<T>, StmError> {
        let r = self.dref(name)?;
        self.seed(&r, &init)?;
        Ok(r)
    }

    /// A ref whose version chain lives in this process instead of the
    /// coordinator. Same protocol, no distribution; meant for benchmarks
    /// and same-process tests.
    pub fn local_ref<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        init: Option<T>,
    ) -> Result<Ref<T>, StmError> {
        let state = self.ref_state(name, Backend::Local)?;
        let r = Ref::from_state(state, self.inner.clone());
        if let Some(init) = init {
            self.seed(&r, &init)?;
        }
        Ok(r)
    }

    fn seed<T: Serialize + DeserializeOwned>(
        &self,
        r: &Ref<T>,
        init: &T,
    ) -> Result<(), StmError> {
        if r.state.container.versions()?.is_empty() {
            let bytes = codec::encode(init)?;
            let state = r.state.clone();
            self.atomically(move |tx| tx.store_bytes(state.clone(), bytes.clone()))?;
        }
        Ok(())
    }

    fn ref_state(&self, name: &str, backend: Backend) -> Result<Arc<RefState>, StmError> {
        tree::validate_name(name)?;
        let inner = &self.inner;
        let l = &inner.layout;
        let registry_key = match backend {
            Backend::Coordinator => l.ref_root(name),
            // local refs share chains by name but never mix with the
            // coordinator-backed handle of the same name
            Backend::Local => format!("local:{}", l.ref_root(name)),
        };
        if let Some(existing) = inner.refs.get(&registry_key).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }

        // materialize the subtree; the lock directory is shared by both
        // backends
        inner.create_if_absent(&l.ref_root(name))?;
        inner.create_if_absent(&l.ref_history(name))?;
        inner.create_if_absent(&l.ref_txn(name))?;
        inner.create_if_absent(&l.ref_lock(name))?;

        let container: Arc<dyn StateContainer> = match backend {
            Backend::Coordinator => Arc::new(CoordinatorContainer::new(
                inner.coord.clone(),
                l.ref_history(name),
                inner.config.history_retention,
            )),
            Backend::Local => Arc::new(
                inner
                    .locals
                    .container(&l.ref_history(name), inner.config.history_retention),
            ),
        };
        container.init_state()?;

        let lock = DistLock::new(
            inner.coord.clone(),
            l.ref_lock(name),
            inner.owner.clone(),
        );
        let state = Arc::new(RefState::new(
            name.to_string(),
            l.ref_root(name),
            container,
            lock,
            l.ref_txn(name),
        ));
        inner.refs.insert(registry_key, Arc::downgrade(&state));
        Ok(state)
    }

    /// Handle to the named atom, materializing its cell on first use.
    /// The cell starts unbound; `reset` gives it its first value.
    pub fn atom<T: Serialize + DeserializeOwned>(&self, name: &str) -> Result<Atom<T>, StmError> {
        tree::validate_name(name)?;
        let inner = &self.inner;
        if let Some(existing) = inner.atoms.get(name).and_then(|w| w.upgrade()) {
            return Ok(Atom::from_state(existing, inner.clone()));
        }
        let l = &inner.layout;
        inner.create_if_absent(&l.atom_root(name))?;
        inner.create_if_absent(&l.atom_data(name))?;
        let state = Arc::new(AtomState::new(name.to_string(), l.atom_data(name)));
        inner.atoms.insert(name.to_string(), Arc::downgrade(&state));
        Ok(Atom::from_state(state, inner.clone()))
    }

    /// Like [`atom`](StmClient::atom), seeding `init` iff the cell is
    /// unbound.
    pub fn atom_init<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        init: T,
    ) -> Result<Atom<T>, StmError> {
        let a = self.atom(name)?;
        let (bytes, _) = self.inner.coord.get(&self.inner.layout.atom_data(name))?;
        if bytes.is_empty() {
            a.reset(init)?;
        }
        Ok(a)
    }

    /// Run `body` transactionally: at-most-once visible effect, as many
    /// attempts as it takes up to `max_retries`, against a consistent
    /// per-attempt snapshot.
    ///
    /// `body` must be re-runnable and free of side effects other than ref
    /// operations; use [`Transaction::on_commit`] for I/O tied to the
    /// outcome.
    pub fn atomically<T, F>(&self, mut body: F) -> Result<T, StmError>
    where
        F: FnMut(&mut Transaction) -> Result<T, StmError>,
    {
        let cfg = &self.inner.config;
        let deadline = Instant::now() + cfg.transaction_timeout;
        let backoff = RetryBackoff::new(cfg.retry_backoff_initial, cfg.retry_backoff_max);
        let attempts = cfg.max_retries.max(1);

        for attempt in 0..attempts {
            if Instant::now() >= deadline {
                return Err(StmError::Timeout);
            }
            let mut tx = Transaction::begin(self.inner.clone(), deadline)?;
            let outcome = match body(&mut tx) {
                Ok(value) => tx.commit().map(|()| value),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() => {
                    if attempt + 1 == attempts {
                        tx.mark_aborted();
                        return Err(StmError::RetryExhausted { attempts });
                    }
                    tx.mark_retry();
                    tracing::debug!(id = %tx.id(), attempt, "transaction conflict, backing off");
                    backoff.sleep(attempt);
                }
                Err(e) => {
                    tx.mark_aborted();
                    return Err(e);
                }
            }
        }
        Err(StmError::RetryExhausted { attempts })
    }
}

#[derive(Clone, Copy)]
enum Backend {
    Coordinator,
    Local,
}
