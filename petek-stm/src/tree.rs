//! Coordinator subtree layout.
//!
//! ```text
//! {root}/history/t-<seq>              transaction nodes, data = TxnState byte
//! {root}/refs/<name>/history/v-<id>   committed versions, data = encoded value
//! {root}/refs/<name>/txn/t-<id>       ephemeral marker of the in-flight writer
//! {root}/refs/<name>/lock/...         read/write lock queue
//! {root}/atoms/<name>/data            atom cell, data = encoded value
//! ```

use crate::errors::StmError;
use crate::txn::TxnId;

#[derive(Debug, Clone)]
pub(crate) struct StmLayout {
    root: String,
}

impl StmLayout {
    pub fn new(root: &str) -> Self {
        Self {
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn history(&self) -> String {
        format!("{}/history", self.root)
    }

    /// Sequential-create prefix for allocating transaction ids.
    pub fn txn_prefix(&self) -> String {
        format!("{}/history/t-", self.root)
    }

    pub fn txn_node(&self, id: TxnId) -> String {
        format!("{}/history/{}", self.root, id.node_name())
    }

    pub fn refs(&self) -> String {
        format!("{}/refs", self.root)
    }

    pub fn ref_root(&self, name: &str) -> String {
        format!("{}/refs/{}", self.root, name)
    }

    pub fn ref_history(&self, name: &str) -> String {
        format!("{}/refs/{}/history", self.root, name)
    }

    pub fn ref_txn(&self, name: &str) -> String {
        format!("{}/refs/{}/txn", self.root, name)
    }

    pub fn ref_lock(&self, name: &str) -> String {
        format!("{}/refs/{}/lock", self.root, name)
    }

    pub fn atoms(&self) -> String {
        format!("{}/atoms", self.root)
    }

    pub fn atom_root(&self, name: &str) -> String {
        format!("{}/atoms/{}", self.root, name)
    }

    pub fn atom_data(&self, name: &str) -> String {
        format!("{}/atoms/{}/data", self.root, name)
    }
}

/// Ref and atom names become single path segments under the STM root.
pub(crate) fn validate_name(name: &str) -> Result<(), StmError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(StmError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}
