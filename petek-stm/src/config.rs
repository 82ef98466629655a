use std::time::Duration;

/// Tunables for one STM client.
///
/// The defaults suit small clusters and tests; production deployments
/// mostly tune `transaction_timeout` (coordinator round trips dominate)
/// and `history_retention` (long-running readers need deeper windows).
#[derive(Debug, Clone)]
pub struct StmConfig {
    /// Coordinator path prefix under which the whole STM lives.
    pub stm_root: String,
    /// Attempt ceiling per transactional block.
    pub max_retries: u32,
    /// First retry backoff delay.
    pub retry_backoff_initial: Duration,
    /// Backoff ceiling.
    pub retry_backoff_max: Duration,
    /// Committed versions retained per ref; older versions are pruned and
    /// reads below the window fail with `StaleRead`.
    pub history_retention: usize,
    /// Wall-clock budget for one transactional block, including retries
    /// and lock waits.
    pub transaction_timeout: Duration,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            stm_root: "/stm".to_string(),
            max_retries: 100,
            retry_backoff_initial: Duration::from_millis(10),
            retry_backoff_max: Duration::from_millis(500),
            history_retention: 10,
            transaction_timeout: Duration::from_millis(10_000),
        }
    }
}

impl StmConfig {
    /// Default configuration rooted at a non-default coordinator path.
    pub fn rooted(root: impl Into<String>) -> Self {
        Self {
            stm_root: root.into(),
            ..Self::default()
        }
    }
}
