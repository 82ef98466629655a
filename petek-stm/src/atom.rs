//! Distributed atoms.
//!
//! An [`Atom<T>`] is a named compare-and-set cell outside the transaction
//! machinery: its whole state is one coordinator node whose data version
//! is the CAS token. Contended swaps loop with the same jittered backoff
//! the transaction retry path uses. Every handle to the same name within
//! one client shares the in-process validator and watcher registries
//! through [`AtomState`].

use crate::backoff::RetryBackoff;
use crate::client::ClientInner;
use crate::codec;
use crate::errors::StmError;
use crate::refs::ErasedValidator;
use crate::watch::{self, ErasedWatch};
use parking_lot::Mutex;
use petek::CoordError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Shared, untyped core of one named atom.
pub(crate) struct AtomState {
    pub name: String,
    pub data_path: String,
    validator: Mutex<Option<ErasedValidator>>,
    watchers: Mutex<HashMap<String, ErasedWatch>>,
}

impl AtomState {
    pub fn new(name: String, data_path: String) -> Self {
        Self {
            name,
            data_path,
            validator: Mutex::new(None),
            watchers: Mutex::new(HashMap::new()),
        }
    }
}

/// A named distributed cell with compare-and-set semantics.
///
/// Atoms never participate in transactions; every mutation is its own
/// linearization point on the coordinator.
pub struct Atom<T> {
    state: Arc<AtomState>,
    client: Arc<ClientInner>,
    _val: PhantomData<fn() -> T>,
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            client: self.client.clone(),
            _val: PhantomData,
        }
    }
}

impl<T> Atom<T> {
    pub(crate) fn from_state(state: Arc<AtomState>, client: Arc<ClientInner>) -> Self {
        Self {
            state,
            client,
            _val: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    fn check(&self, bytes: &[u8]) -> Result<(), StmError> {
        let passed = match &*self.state.validator.lock() {
            Some(v) => v(bytes)?,
            None => true,
        };
        if passed {
            Ok(())
        } else {
            Err(StmError::ValidatorFailure {
                name: self.state.name.clone(),
            })
        }
    }

    fn notify(&self, old: Vec<u8>, new: Vec<u8>) {
        self.client
            .watcher
            .notify(watch::snapshot(&self.state.watchers.lock()), old, new);
    }

    /// Current cell contents and CAS token.
    fn fetch(&self) -> Result<(Vec<u8>, i64), StmError> {
        Ok(self.client.coord.get(&self.state.data_path)?)
    }
}

impl<T: Serialize + DeserializeOwned> Atom<T> {
    /// Read the current value.
    pub fn load(&self) -> Result<T, StmError> {
        let (bytes, _) = self.fetch()?;
        if bytes.is_empty() {
            return Err(StmError::Unbound {
                name: self.state.name.clone(),
            });
        }
        codec::decode(&bytes)
    }

    /// Unconditionally replace the value. Runs the validator; fires
    /// watches when the cell previously held a value.
    pub fn reset(&self, value: T) -> Result<T, StmError> {
        let bytes = codec::encode(&value)?;
        self.check(&bytes)?;
        let (old, _) = self.fetch()?;
        self.client.coord.set(&self.state.data_path, &bytes, None)?;
        if !old.is_empty() {
            self.notify(old, bytes);
        }
        Ok(value)
    }

    /// Atomically replace `old` with `new`. Returns whether the write
    /// happened; on `false` the cell is untouched.
    pub fn compare_and_set(&self, old: &T, new: T) -> Result<bool, StmError>
    where
        T: PartialEq,
    {
        let (cur_bytes, token) = self.fetch()?;
        if cur_bytes.is_empty() {
            return Ok(false);
        }
        let current: T = codec::decode(&cur_bytes)?;
        if current != *old {
            return Ok(false);
        }
        let new_bytes = codec::encode(&new)?;
        self.check(&new_bytes)?;
        match self
            .client
            .coord
            .set(&self.state.data_path, &new_bytes, Some(token))
        {
            Ok(_) => {
                self.notify(cur_bytes, new_bytes);
                Ok(true)
            }
            Err(CoordError::BadVersion { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-compute-CAS loop: replace the value with `f(current)`,
    /// retrying with backoff until the conditional write lands. Returns
    /// the value that won.
    pub fn swap<F: Fn(T) -> T>(&self, f: F) -> Result<T, StmError> {
        let backoff = RetryBackoff::new(
            self.client.config.retry_backoff_initial,
            self.client.config.retry_backoff_max,
        );
        let mut attempt: u32 = 0;
        loop {
            let (cur_bytes, token) = self.fetch()?;
            if cur_bytes.is_empty() {
                return Err(StmError::Unbound {
                    name: self.state.name.clone(),
                });
            }
            let next = f(codec::decode(&cur_bytes)?);
            let new_bytes = codec::encode(&next)?;
            self.check(&new_bytes)?;
            match self
                .client
                .coord
                .set(&self.state.data_path, &new_bytes, Some(token))
            {
                Ok(_) => {
                    self.notify(cur_bytes, new_bytes);
                    return Ok(next);
                }
                Err(CoordError::BadVersion { .. }) => {
                    backoff.sleep(attempt);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Install a validator run against every prospective value, for
    /// `reset`, `compare_and_set`, and `swap` alike.
    pub fn set_validator(&self, f: impl Fn(&T) -> bool + Send + Sync + 'static) {
        let erased: ErasedValidator = Box::new(move |bytes| Ok(f(&codec::decode::<T>(bytes)?)));
        *self.state.validator.lock() = Some(erased);
    }

    pub fn clear_validator(&self) {
        *self.state.validator.lock() = None;
    }

    /// Register a watch fired with `(old, new)` after every successful
    /// mutation of this atom through the owning client.
    pub fn add_watch(&self, key: impl Into<String>, f: impl Fn(&T, &T) + Send + Sync + 'static) {
        let name = self.state.name.clone();
        let erased: ErasedWatch = Arc::new(move |old, new| {
            match (codec::decode::<T>(old), codec::decode::<T>(new)) {
                (Ok(o), Ok(n)) => f(&o, &n),
                _ => tracing::warn!(%name, "watch skipped: undecodable payload"),
            }
        });
        self.state.watchers.lock().insert(key.into(), erased);
    }

    pub fn remove_watch(&self, key: &str) -> bool {
        self.state.watchers.lock().remove(key).is_some()
    }

    /// Tear down the atom's coordinator subtree. Every other handle to
    /// the name becomes unusable.
    pub fn destroy(self) -> Result<(), StmError> {
        self.client.destroy_atom(&self.state.name)
    }
}
