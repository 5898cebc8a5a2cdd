//! Configuration for the sync engine.

use rand::Rng;
use rowsync_batch::{BatchConfig, DEFAULT_BATCH_SIZE};
use rowsync_core::CyclePolicy;
use rowsync_protocol::ConflictPolicy;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Configuration for a client's sync sessions.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Scope to synchronize.
    pub scope_name: String,
    /// Client participant id (unique per client database).
    pub client_id: Uuid,
    /// Root directory for upload and download batches.
    pub batch_dir: PathBuf,
    /// Rows per batch part.
    pub batch_size: usize,
    /// Rows of one part applied concurrently.
    pub degree_of_parallelism: usize,
    /// Policy for true conflicts when no resolver is set.
    pub conflict_policy: ConflictPolicy,
    /// What to do with foreign-key cycles.
    pub cycle_policy: CyclePolicy,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Timeout of a single transport call.
    pub timeout: Duration,
    /// Age after which another session's claim on the scope is ignored.
    pub session_lease: Duration,
    /// Whether sessions purge tombstones no participant still needs.
    pub clean_metadata: bool,
    /// Sync interval for scheduled sync.
    pub sync_interval: Option<Duration>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(scope_name: impl Into<String>, client_id: Uuid) -> Self {
        Self {
            scope_name: scope_name.into(),
            client_id,
            batch_dir: std::env::temp_dir().join("rowsync-batches"),
            batch_size: DEFAULT_BATCH_SIZE,
            degree_of_parallelism: 4,
            conflict_policy: ConflictPolicy::default(),
            cycle_policy: CyclePolicy::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            session_lease: Duration::from_secs(10 * 60),
            clean_metadata: true,
            sync_interval: None,
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

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the session lease.
    pub fn with_session_lease(mut self, lease: Duration) -> Self {
        self.session_lease = lease;
        self
    }

    /// Enables or disables metadata cleaning.
    pub fn with_clean_metadata(mut self, enabled: bool) -> Self {
        self.clean_metadata = enabled;
        self
    }

    /// Sets the sync interval for scheduled sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Returns the batch engine configuration.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::new(&self.batch_dir).with_batch_size(self.batch_size)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default", Uuid::new_v4())
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top of the capped delay.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let client = Uuid::new_v4();
        let config = SyncConfig::new("orders", client)
            .with_batch_size(0)
            .with_degree_of_parallelism(8)
            .with_conflict_policy(ConflictPolicy::ClientWins)
            .with_cycle_policy(CyclePolicy::AppendInDeclarationOrder)
            .with_timeout(Duration::from_secs(60))
            .with_clean_metadata(false);

        assert_eq!(config.scope_name, "orders");
        assert_eq!(config.client_id, client);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.degree_of_parallelism, 8);
        assert_eq!(config.conflict_policy, ConflictPolicy::ClientWins);
        assert_eq!(config.cycle_policy, CyclePolicy::AppendInDeclarationOrder);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert!(!config.clean_metadata);
        assert_eq!(config.batch_config().batch_size, 1);
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.conflict_policy, ConflictPolicy::ServerWins);
        assert_eq!(config.cycle_policy, CyclePolicy::Fail);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.sync_interval.is_none());
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
        assert!(delay2 <= Duration::from_millis(250));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(6250));

        let exact = config.with_jitter(false).delay_for_attempt(9);
        assert_eq!(exact, Duration::from_secs(5));
    }
}
