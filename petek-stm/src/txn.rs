use std::fmt;

/// Cluster-wide monotonic transaction identifier, allocated by creating a
/// sequential node under the STM history directory. Doubles as the read
/// point of the attempt it belongs to and as the version tag of every
/// value it commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl TxnId {
    pub const MAX: TxnId = TxnId(u64::MAX);

    /// Node name under a ref's history directory for the version this
    /// transaction committed. Zero-padded so lexicographic child order is
    /// numeric order.
    pub(crate) fn version_name(self) -> String {
        format!("v-{:010}", self.0)
    }

    /// Node name under the STM history directory.
    pub(crate) fn node_name(self) -> String {
        format!("t-{:010}", self.0)
    }

    /// Parse the numeric suffix of a sequential or version node name
    /// (`t-0000000042`, `v-0000000042`).
    pub(crate) fn parse_suffix(name: &str) -> Option<TxnId> {
        let digits = name.rsplit('-').next()?;
        digits.parse::<u64>().ok().map(TxnId)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t-{:010}", self.0)
    }
}

/// Durable lifecycle of one transaction attempt, stored as a single byte
/// on its history node. `Committed` and `Aborted` are terminal.
///
/// Readers resolve the state of the transaction tagging a version entry
/// before trusting it: only `Committed` entries are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Running = 0,
    Retry = 1,
    Committing = 2,
    Committed = 3,
    Aborted = 4,
}

impl TxnState {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<TxnState> {
        match b {
            0 => Some(TxnState::Running),
            1 => Some(TxnState::Retry),
            2 => Some(TxnState::Committing),
            3 => Some(TxnState::Committed),
            4 => Some(TxnState::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }
}
