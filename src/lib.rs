//! Petek: coordination substrate for distributed shared state.
//!
//! Petek models the small slice of an ordered, linearizable, hierarchical
//! key-value service (a ZooKeeper-style coordinator) that distributed
//! synchronization recipes actually need: persistent and ephemeral nodes,
//! per-parent sequential naming, conditional writes, and the ability to
//! block until a node disappears.
//!
//! # Architecture
//!
//! - [`Coordinator`] is the seam. Code written against it does not know
//!   whether it is talking to a real coordination service or to the
//!   in-process [`MemoryCluster`].
//! - [`MemoryCluster`] is a single-process implementation with full
//!   session semantics: every [`MemorySession`] owns its ephemeral nodes,
//!   and expiring a session removes them and wakes blocked waiters. It is
//!   linearizable by construction (one lock around the whole tree) and is
//!   intended for tests and benchmarks, not for distribution.
//!
//! Production deployments implement [`Coordinator`] over their actual
//! coordination-service client; everything above the trait carries over
//! unchanged.

mod coordinator;
mod error;
mod memory;
mod path;

pub use coordinator::{Coordinator, CreateMode};
pub use error::CoordError;
pub use memory::{MemoryCluster, MemorySession};
