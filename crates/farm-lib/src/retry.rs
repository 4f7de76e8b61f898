//! Bounded exponential backoff and wall-clock deadlines for external calls

use crate::cluster::ClusterApiError;
use crate::error::{FarmError, FarmResult};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Run a cluster call under a hard wall-clock bound
///
/// Expiry becomes `OperationTimeout`, any other failure `Cluster`.
pub async fn with_deadline<T, F>(
    entity: &str,
    operation: &str,
    timeout: Duration,
    call: F,
) -> FarmResult<T>
where
    F: Future<Output = Result<T, ClusterApiError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(FarmError::cluster(entity, operation, source)),
        Err(_) => {
            tracing::warn!(
                entity = %entity,
                operation = %operation,
                timeout_ms = timeout.as_millis() as u64,
                "External operation timed out"
            );
            Err(FarmError::OperationTimeout {
                entity: entity.to_string(),
                operation: operation.to_string(),
                timeout,
            })
        }
    }
}

/// Serde helpers for millisecond durations in config files
pub mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
