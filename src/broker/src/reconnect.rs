//! Exponential backoff with jitter for broker reconnection, capped at a
//! maximum number of attempts.

use crate::broker::Broker;
use foreman_registry::ForemanError;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("gave up after {attempts} connect attempts: {source}")]
    Exhausted { attempts: u32, source: ForemanError },
}

/// Reconnect policy: delay doubles each attempt up to `max_delay`, with up
/// to 50% jitter added so a fleet of workers doesn't retry in lockstep.
/// `max_retries` of `None` means retry forever.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: Option<u32>) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
        }
    }

    /// Whether `attempt` (0-indexed) is still allowed under this policy.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt < max,
            None => true,
        }
    }

    /// The delay to sleep before `attempt` (0-indexed), including up to 50%
    /// jitter so a fleet of workers doesn't retry in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let raw = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.5);
        raw.mul_f64(1.0 - jitter_fraction)
    }

    /// Connect to `broker`, retrying with backoff per this policy until it
    /// succeeds or `max_retries` is exhausted.
    pub async fn connect_with_retry(&self, broker: &dyn Broker) -> Result<(), ReconnectError> {
        let mut attempt = 0;
        loop {
            match broker.connect().await {
                Ok(()) => return Ok(()),
                Err(err) if self.allows(attempt) => {
                    warn!(attempt, error = %err, "broker connect failed, retrying");
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(ReconnectError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(2),
            None,
        );
        assert!(policy.delay_for(0) < policy.delay_for(5));
        assert!(policy.delay_for(20) <= Duration::from_secs(3));
    }

    #[test]
    fn max_retries_caps_attempts() {
        let policy = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_secs(1), Some(3));
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn unlimited_retries_always_allowed() {
        let policy = ReconnectPolicy::default();
        assert!(policy.allows(10_000));
    }
}
