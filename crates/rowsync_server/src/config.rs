//! Server configuration.

use rowsync_batch::{BatchConfig, DEFAULT_BATCH_SIZE};
use rowsync_core::CyclePolicy;
use rowsync_engine::RetryConfig;
use rowsync_protocol::ConflictPolicy;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server participant id. Rows applied from the server carry it as
    /// their origin on clients.
    pub server_id: Uuid,
    /// Root directory for download batches.
    pub batch_dir: PathBuf,
    /// Rows per batch part.
    pub batch_size: usize,
    /// Rows of one part applied concurrently.
    pub degree_of_parallelism: usize,
    /// Policy for true conflicts found while applying uploads.
    pub conflict_policy: ConflictPolicy,
    /// What to do with foreign-key cycles.
    pub cycle_policy: CyclePolicy,
    /// Retry configuration for adapter calls.
    pub retry: RetryConfig,
    /// Age after which an open session of a client may be replaced.
    pub session_lease: Duration,
    /// Whether clean-metadata requests purge tombstones.
    pub clean_metadata: bool,
}

impl ServerConfig {
    /// Creates a configuration for the server `server_id`.
    pub fn new(server_id: Uuid) -> Self {
        Self {
            server_id,
            batch_dir: std::env::temp_dir().join("rowsync-server-batches"),
            batch_size: DEFAULT_BATCH_SIZE,
            degree_of_parallelism: 4,
            conflict_policy: ConflictPolicy::default(),
            cycle_policy: CyclePolicy::default(),
            retry: RetryConfig::default(),
            session_lease: Duration::from_secs(10 * 60),
            clean_metadata: true,
        }
    }

    /// Sets the batch directory.
    pub fn with_batch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.batch_dir = dir.into();
        self
    }

    /// Sets the batch size. A size of 0 is treated as 1.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the degree of parallelism. A value of 0 is treated as 1.
    pub fn with_degree_of_parallelism(mut self, degree: usize) -> Self {
        self.degree_of_parallelism = degree.max(1);
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the cycle policy.
    pub fn with_cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the session lease.
    pub fn with_session_lease(mut self, lease: Duration) -> Self {
        self.session_lease = lease;
        self
    }

    /// Enables or disables tombstone purging.
    pub fn with_clean_metadata(mut self, enabled: bool) -> Self {
        self.clean_metadata = enabled;
        self
    }

    /// Returns the batch engine configuration.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::new(self.batch_dir.clone()).with_batch_size(self.batch_size)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.conflict_policy, ConflictPolicy::ServerWins);
        assert!(config.clean_metadata);
    }

    #[test]
    fn config_builder() {
        let id = Uuid::new_v4();
        let config = ServerConfig::new(id)
            .with_batch_dir("/tmp/server-batches")
            .with_batch_size(0)
            .with_degree_of_parallelism(8)
            .with_conflict_policy(ConflictPolicy::ClientWins)
            .with_session_lease(Duration::from_secs(5))
            .with_clean_metadata(false);

        assert_eq!(config.server_id, id);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.degree_of_parallelism, 8);
        assert_eq!(config.session_lease, Duration::from_secs(5));
        assert!(!config.clean_metadata);
        assert_eq!(
            config.batch_config().root,
            PathBuf::from("/tmp/server-batches")
        );
    }
}
