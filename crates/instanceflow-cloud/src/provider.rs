//! Cloud client trait definition

use crate::error::Result;
use crate::instance::{CreateInstancesRequest, InstanceDescription, InstanceStateChange};
use async_trait::async_trait;
use std::time::Duration;

/// Compute API capability set
///
/// Every call takes the provider region explicitly, so a single client can
/// serve declarative records that live in different regions. The EC2 backend
/// and the in-process `FakeCloud` both implement this trait.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Returns the backend name (e.g., "aws", "fake")
    fn name(&self) -> &str;

    /// Launch instances. Returns the instances the provider reports as created.
    async fn create_instances(
        &self,
        region: &str,
        request: &CreateInstancesRequest,
    ) -> Result<Vec<InstanceDescription>>;

    /// Describe the given instance, flattening reservations
    async fn describe_instances(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceDescription>>;

    /// Instances launched with the given idempotency token. Empty when none were.
    async fn find_by_client_token(
        &self,
        region: &str,
        client_token: &str,
    ) -> Result<Vec<InstanceDescription>>;

    /// Request termination of the given instance
    async fn terminate_instances(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Vec<InstanceStateChange>>;
}

/// Retry configuration for failed reconciliations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(32) as i32);
        Duration::from_millis(delay as u64).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(30)); // capped at max
        assert_eq!(config.delay_for_attempt(1000), Duration::from_secs(30));
    }
}
