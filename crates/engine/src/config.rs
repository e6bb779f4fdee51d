// Engine configuration
// Decision: every process reads the same env variables; WORKER_ID is the only one that must differ

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::CompletenessAlgorithm;
use crate::node::AdmissionConfig;
use crate::retry::RetryPolicy;

/// Configuration shared by the orchestrator and its background loops
///
/// # Example
///
/// ```
/// use flowmesh_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_worker_id("worker-a")
///     .with_retry_sweep_interval(Duration::from_millis(200));
/// assert_eq!(config.worker_id, "worker-a");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Identity of this process in leases and ownership
    pub worker_id: String,

    /// Pause between two retry sweeps
    #[serde(with = "duration_millis")]
    pub retry_sweep_interval: Duration,

    /// Period of the status calculation
    #[serde(with = "duration_millis")]
    pub status_interval: Duration,

    /// TTL of `retry:` and `trans:` leases
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// TTL of trace ownership leases (renewed by the status loop)
    #[serde(with = "duration_millis")]
    pub ownership_ttl: Duration,

    /// Window after claiming a trace during which it is never released
    #[serde(with = "duration_millis")]
    pub ownership_protect: Duration,

    /// Upper bound of tickets and traces read per sweep
    pub sweep_batch_size: usize,

    /// In-flight limit of nodes that do not declare one
    pub node_max_in_flight: usize,

    pub admission: AdmissionConfig,
    pub retry: RetryPolicy,
    pub completeness: CompletenessAlgorithm,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            retry_sweep_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            ownership_ttl: Duration::from_secs(60),
            ownership_protect: Duration::from_secs(10),
            sweep_batch_size: 100,
            node_max_in_flight: 64,
            admission: AdmissionConfig::default(),
            retry: RetryPolicy::default(),
            completeness: CompletenessAlgorithm::default(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_id = std::env::var("WORKER_ID").unwrap_or(defaults.worker_id);
        let retry = RetryPolicy::fixed(
            env_millis("RETRY_BACKOFF_MS").unwrap_or(defaults.retry.initial_interval),
            env_parse("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
        );

        Self {
            worker_id,
            retry_sweep_interval: env_millis("RETRY_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.retry_sweep_interval),
            status_interval: env_millis("STATUS_INTERVAL_MS").unwrap_or(defaults.status_interval),
            lease_ttl: env_millis("LEASE_TTL_MS").unwrap_or(defaults.lease_ttl),
            ownership_ttl: env_millis("OWNERSHIP_TTL_MS").unwrap_or(defaults.ownership_ttl),
            ownership_protect: env_millis("OWNERSHIP_PROTECT_MS")
                .unwrap_or(defaults.ownership_protect),
            sweep_batch_size: env_parse("SWEEP_BATCH_SIZE").unwrap_or(defaults.sweep_batch_size),
            node_max_in_flight: env_parse("NODE_MAX_IN_FLIGHT")
                .unwrap_or(defaults.node_max_in_flight),
            retry,
            ..defaults
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_retry_sweep_interval(mut self, interval: Duration) -> Self {
        self.retry_sweep_interval = interval;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_ownership_protect(mut self, window: Duration) -> Self {
        self.ownership_protect = window;
        self
    }

    pub fn with_node_max_in_flight(mut self, max: usize) -> Self {
        self.node_max_in_flight = max.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionConfig) -> Self {
        self.admission = admission;
        self
    }

    pub fn with_completeness(mut self, algorithm: CompletenessAlgorithm) -> Self {
        self.completeness = algorithm;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
