use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::config::RetrySection;

use super::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Wait before the retry that follows attempt number `attempt` (zero based).
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.round() as u64)
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            initial_delay: Duration::from_millis(section.initial_delay_ms),
            multiplier: section.multiplier,
            max_delay: Duration::from_millis(section.max_delay_ms),
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// `policy.max_attempts` attempts have been made.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error: Option<ServiceError> = None;
    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt + 1 == attempts => last_error = Some(err),
            Err(err) => {
                let delay = policy.compute_delay(attempt);
                warn!(attempt = attempt + 1, wait = ?delay, stage = label, error = %err, "retrying operation");
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or(ServiceError::Timeout { attempts }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.compute_delay(0), Duration::from_millis(500));
        assert_eq!(policy.compute_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.compute_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.compute_delay(3), Duration::from_secs(3));
        assert_eq!(policy.compute_delay(9), Duration::from_secs(3));
    }
}
