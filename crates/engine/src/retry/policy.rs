//! Retry policy for parked batches

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How often and how far apart a retry batch is re-attempted
///
/// The default is a fixed backoff window: every claim pushes the ticket's
/// next retry time forward by the same interval.
///
/// # Example
///
/// ```
/// use flowmesh_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_secs(2), 4);
/// assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
/// assert!(policy.is_exhausted(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of executions of a context at one node (including the first)
    pub max_attempts: u32,

    /// Backoff window after the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap of the backoff window
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth of the window per retry (1.0 keeps it fixed)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,

    /// Failure kinds that go straight to ERROR
    #[serde(default)]
    pub non_retryable_kinds: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 5)
    }
}

impl RetryPolicy {
    /// Fixed backoff window, no jitter
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_kinds: vec![],
        }
    }

    /// Exponential backoff with 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_kinds: vec![],
        }
    }

    /// A policy that fails on the first retryable error
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_non_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.non_retryable_kinds.push(kind.into());
        self
    }

    /// Window to wait after the `retry`-th claim (1-based) of a batch
    pub fn backoff_after(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether a failure of `kind` may be retried at all
    pub fn should_retry(&self, kind: Option<&str>) -> bool {
        match kind {
            Some(kind) => !self.non_retryable_kinds.iter().any(|k| k == kind),
            None => true,
        }
    }

    /// Whether a batch claimed `retry_count` times has used every attempt
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) >= self.max_attempts
    }
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
