use crate::txn::TxnId;
use petek::CoordError;
use thiserror::Error;

/// Typed errors for distributed STM operations.
#[derive(Debug, Error)]
pub enum StmError {
    /// A ref was read or mutated through a transaction handle that is no
    /// longer running.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// In-band conflict signal: the attempt observed state newer than its
    /// read point and must re-run. Consumed by
    /// [`StmClient::atomically`](crate::StmClient::atomically); user code
    /// may also return it to request a retry explicitly.
    #[error("transaction conflict, retry required")]
    Retry,

    /// A validator rejected the prospective new value. Not retriable.
    #[error("validator rejected new value for '{name}'")]
    ValidatorFailure { name: String },

    /// The per-transaction attempt budget ran out under contention.
    #[error("transaction retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    /// The transaction deadline passed.
    #[error("transaction timed out")]
    Timeout,

    /// The requested version has been pruned from a ref's retained
    /// history window.
    #[error("stale read: version {version} pruned from history")]
    StaleRead { version: TxnId },

    /// The coordinator session expired mid-operation. Any in-flight
    /// transaction is dead: its ephemeral lock nodes are gone and none of
    /// its writes became visible.
    #[error("coordinator session lost")]
    SessionLost,

    /// A named ref or atom that has never been given a value.
    #[error("'{name}' holds no value")]
    Unbound { name: String },

    /// Ref and atom names are single path segments.
    #[error("invalid ref or atom name '{name}'")]
    InvalidName { name: String },

    /// Transport-level coordinator failure.
    #[error(transparent)]
    Coordinator(CoordError),

    /// Value encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<CoordError> for StmError {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::SessionExpired => StmError::SessionLost,
            CoordError::Timeout => StmError::Timeout,
            other => StmError::Coordinator(other),
        }
    }
}

impl StmError {
    /// Whether the transaction loop may transparently re-run the attempt.
    pub(crate) fn is_retriable(&self) -> bool {
        matches!(self, StmError::Retry)
    }
}
