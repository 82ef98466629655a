use thiserror::Error;

/// Typed errors for coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    /// The addressed node does not exist.
    #[error("no node at '{path}'")]
    NoNode { path: String },

    /// A node already exists at the target path.
    #[error("node already exists at '{path}'")]
    NodeExists { path: String },

    /// A conditional write observed a different data version.
    #[error("version check failed at '{path}': expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i64,
        actual: i64,
    },

    /// Delete refused because the node still has children.
    #[error("node '{path}' has children")]
    NotEmpty { path: String },

    /// The path is not a well-formed absolute node path.
    #[error("malformed path '{path}'")]
    BadPath { path: String },

    /// The session backing this handle is no longer valid. Ephemeral
    /// nodes created through it are gone.
    #[error("coordinator session expired")]
    SessionExpired,

    /// A bounded wait ran out of time.
    #[error("coordinator wait timed out")]
    Timeout,
}
