//! Distributed software transactional memory over a coordination service.
//!
//! Cluster-wide refs are mutated inside transactions that are atomic,
//! consistent, and isolated across processes; cluster-wide atoms are
//! independent compare-and-set cells. The only synchronization
//! primitives underneath are the coordinator's sequential nodes,
//! ephemeral nodes, and delete-watches (the [`petek::Coordinator`]
//! seam).
//!
//! # Architecture
//!
//! - **Ids and versions**: every transaction attempt allocates a
//!   sequential id that is both its read point and the version tag of
//!   whatever it commits. A ref's history is a chain of
//!   `(id, encoded value)` entries.
//! - **Reads**: anchored at the read point; each ref read once returns
//!   the same value for the attempt's lifetime. A version entry counts
//!   only if its transaction is durably `Committed`.
//! - **Writes**: buffered locally; commit takes per-ref writer locks in
//!   deterministic order, re-validates reads, publishes `Committing`,
//!   writes versions, publishes `Committed`. A committer dying midway
//!   leaves nothing visible.
//! - **Atoms**: one node per cell, the coordinator data version as the
//!   CAS token.
//!
//! DANGER AHEAD: transactional blocks re-run on conflict. Keep them free
//! of I/O; hang side effects on [`Transaction::on_commit`] instead.
//!
//! # Example
//!
//! ```no_run
//! use petek::MemoryCluster;
//! use petek_stm::{StmClient, StmConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), petek_stm::StmError> {
//! let cluster = MemoryCluster::new();
//! let client = StmClient::connect(Arc::new(cluster.session()), StmConfig::default())?;
//!
//! let account = client.dref_init("account", 100_i64)?;
//! let log = client.dref_init("log", Vec::<i64>::new())?;
//!
//! client.atomically(|tx| {
//!     let balance = tx.alter(&account, |b| b - 30)?;
//!     tx.alter(&log, |mut l| {
//!         l.push(balance);
//!         l
//!     })?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod atom;
mod backoff;
mod client;
pub mod codec;
mod config;
mod container;
mod errors;
mod lock;
mod refs;
mod transaction;
mod tree;
mod txn;
mod watch;

pub use atom::Atom;
pub use client::StmClient;
pub use config::StmConfig;
pub use container::{CoordinatorContainer, LocalContainer, LocalStore, StateContainer};
pub use errors::StmError;
pub use refs::Ref;
pub use transaction::Transaction;
pub use txn::{TxnId, TxnState};
