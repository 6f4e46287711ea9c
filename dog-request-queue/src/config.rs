use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Configuration for a request queue client
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Connection string of the shared backing store
    pub backing_store_endpoint: String,

    /// Prefix applied to every key; one queue owns `{prefix}{queue}:*`
    pub namespace_prefix: String,

    /// Lease length used when a caller does not pass one
    pub default_lease_secs: u64,

    /// Optional expiry applied to every key of a queue on write
    pub ttl_seconds: Option<u64>,

    /// Default `limit` for `list_head`
    pub default_head_limit: usize,

    /// Store-wide mutex settings
    pub mutex: MutexConfig,

    /// Backoff for transient store failures
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backing_store_endpoint: "redis://localhost:6379".to_string(),
            namespace_prefix: "crawlee:".to_string(),
            default_lease_secs: 300, // 5 minutes
            ttl_seconds: None,
            default_head_limit: 100,
            mutex: MutexConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `REDIS_URL`, `DOG_QUEUE_PREFIX`, `DOG_QUEUE_LEASE_SECS`
    /// and `DOG_QUEUE_TTL_SECS`, falling back to defaults for unset variables.
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.backing_store_endpoint = url;
        }
        if let Ok(prefix) = std::env::var("DOG_QUEUE_PREFIX") {
            config.namespace_prefix = prefix;
        }
        if let Ok(secs) = std::env::var("DOG_QUEUE_LEASE_SECS") {
            config.default_lease_secs = parse_env_u64("DOG_QUEUE_LEASE_SECS", &secs)?;
        }
        if let Ok(secs) = std::env::var("DOG_QUEUE_TTL_SECS") {
            config.ttl_seconds = Some(parse_env_u64("DOG_QUEUE_TTL_SECS", &secs)?);
        }

        Ok(config)
    }

    /// Set the backing store endpoint
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.backing_store_endpoint = endpoint.into();
        self
    }

    /// Set the key namespace prefix
    pub fn with_namespace_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    /// Set the default lease length
    pub fn with_default_lease_secs(mut self, secs: u64) -> Self {
        self.default_lease_secs = secs;
        self
    }

    /// Expire every key of a queue `secs` after its last write
    pub fn with_ttl_seconds(mut self, secs: u64) -> Self {
        self.ttl_seconds = Some(secs);
        self
    }

    /// Set mutex settings
    pub fn with_mutex(mut self, mutex: MutexConfig) -> Self {
        self.mutex = mutex;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn ttl(&self) -> Option<Duration> {
        self.ttl_seconds.map(Duration::from_secs)
    }
}

fn parse_env_u64(name: &str, value: &str) -> QueueResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| QueueError::InvalidRequest(format!("{} must be an integer, got {:?}", name, value)))
}

/// Settings for the short-lived store-wide mutex
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// Expiry of the mutex key, so a crashed holder cannot wedge the queue
    pub lock_ttl: Duration,

    /// Acquisition attempts before giving up
    pub retry_count: u32,

    /// Pause between acquisition attempts
    pub retry_delay: Duration,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            retry_count: 10,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Bounded exponential backoff for retryable errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based, the first retry is attempt 2)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(16);
        let delay = self.base_delay.saturating_mul(2_u32.pow(exp));
        delay.min(self.max_delay)
    }
}
