//! Distributed refs.
//!
//! A [`Ref<T>`] is a typed handle to a named, transactionally mutated
//! cell. The heavy lifting lives in the type-erased [`RefState`] shared
//! by every handle to the same name within one client: the version
//! container, the distributed lock, and the in-process validator and
//! watcher registries. Transactions hold refs only through
//! `Arc<RefState>`, so nothing cyclic ties a ref to a transaction.

use crate::client::ClientInner;
use crate::codec;
use crate::container::StateContainer;
use crate::errors::StmError;
use crate::lock::DistLock;
use crate::txn::TxnId;
use crate::watch::{self, ErasedWatch};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

/// Type-erased validator over encoded bytes. Decode failures surface as
/// codec errors, not as rejection.
pub(crate) type ErasedValidator = Box<dyn Fn(&[u8]) -> Result<bool, StmError> + Send + Sync>;

/// Shared, untyped core of one named ref.
pub(crate) struct RefState {
    pub name: String,
    /// Ref root path; registry key within the owning client.
    pub path: String,
    pub container: Arc<dyn StateContainer>,
    pub lock: DistLock,
    /// Directory for the in-flight writer marker.
    pub txn_dir: String,
    validator: Mutex<Option<ErasedValidator>>,
    watchers: Mutex<HashMap<String, ErasedWatch>>,
}

impl RefState {
    pub fn new(
        name: String,
        path: String,
        container: Arc<dyn StateContainer>,
        lock: DistLock,
        txn_dir: String,
    ) -> Self {
        Self {
            name,
            path,
            container,
            lock,
            txn_dir,
            validator: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Run the validator against a prospective value. No validator means
    /// everything passes.
    pub fn run_validator(&self, bytes: &[u8]) -> Result<bool, StmError> {
        match &*self.validator.lock() {
            Some(v) => v(bytes),
            None => Ok(true),
        }
    }

    pub fn set_validator(&self, v: Option<ErasedValidator>) {
        *self.validator.lock() = v;
    }

    pub fn has_validator(&self) -> bool {
        self.validator.lock().is_some()
    }

    pub fn add_watch(&self, key: String, w: ErasedWatch) {
        self.watchers.lock().insert(key, w);
    }

    pub fn remove_watch(&self, key: &str) -> bool {
        self.watchers.lock().remove(key).is_some()
    }

    pub fn watchers_snapshot(&self) -> Vec<ErasedWatch> {
        watch::snapshot(&self.watchers.lock())
    }
}

/// A named distributed ref holding a `T`.
///
/// Reads and writes go through a [`Transaction`](crate::Transaction)
/// (`tx.load`, `tx.store`, `tx.alter`); [`Ref::latest`] is the only
/// operation that works outside one. Handles are cheap to clone and
/// share watcher/validator state per client.
pub struct Ref<T> {
    pub(crate) state: Arc<RefState>,
    pub(crate) client: Arc<ClientInner>,
    _val: PhantomData<fn() -> T>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            client: self.client.clone(),
            _val: PhantomData,
        }
    }
}

impl<T> Ref<T> {
    pub(crate) fn from_state(state: Arc<RefState>, client: Arc<ClientInner>) -> Self {
        Self {
            state,
            client,
            _val: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }
}

impl<T: Serialize + DeserializeOwned> Ref<T> {
    /// Latest committed value, read outside any transaction. Takes the
    /// reader lock only for the duration of the version lookup.
    pub fn latest(&self) -> Result<T, StmError> {
        let deadline = Instant::now() + self.client.config.transaction_timeout;
        let guard = self.state.lock.read(deadline)?;
        let found = self
            .client
            .latest_committed(self.state.container.as_ref(), TxnId::MAX);
        let _ = guard.unlock();
        match found? {
            Some((_, bytes)) => codec::decode(&bytes),
            None => Err(StmError::Unbound {
                name: self.state.name.clone(),
            }),
        }
    }

    /// Install a validator: a pure predicate every prospective new value
    /// must pass at commit time. Rejection fails the whole transaction
    /// with [`StmError::ValidatorFailure`].
    pub fn set_validator(&self, f: impl Fn(&T) -> bool + Send + Sync + 'static) {
        let erased: ErasedValidator = Box::new(move |bytes| Ok(f(&codec::decode::<T>(bytes)?)));
        self.state.set_validator(Some(erased));
    }

    pub fn clear_validator(&self) {
        self.state.set_validator(None);
    }

    pub fn has_validator(&self) -> bool {
        self.state.has_validator()
    }

    /// Register a watch fired after every successful commit that mutated
    /// this ref, with the before and after values. Callbacks run on the
    /// client's watcher thread; panics are isolated and logged.
    pub fn add_watch(&self, key: impl Into<String>, f: impl Fn(&T, &T) + Send + Sync + 'static) {
        let name = self.state.name.clone();
        let erased: ErasedWatch = Arc::new(move |old, new| {
            match (codec::decode::<T>(old), codec::decode::<T>(new)) {
                (Ok(o), Ok(n)) => f(&o, &n),
                _ => tracing::warn!(%name, "watch skipped: undecodable payload"),
            }
        });
        self.state.add_watch(key.into(), erased);
    }

    pub fn remove_watch(&self, key: &str) -> bool {
        self.state.remove_watch(key)
    }

    /// Tear down this ref's coordinator subtree. Every other handle to
    /// the name becomes unusable.
    pub fn destroy(self) -> Result<(), StmError> {
        self.client.destroy_ref(&self.state)
    }
}
