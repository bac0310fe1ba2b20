use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Pending,
    Done(T),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One check per second for `seconds` seconds.
    pub fn per_second(seconds: u64) -> Self {
        Self::new(Duration::from_secs(1), seconds.max(1) as u32)
    }
}

/// Checks `operation` every `policy.interval` until it reports a terminal
/// status. A transient error consumes an attempt; any other error aborts.
pub async fn poll_until<F, Fut, T>(policy: &PollPolicy, label: &str, mut operation: F) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<PollStatus<T>>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match operation().await {
            Ok(PollStatus::Done(value)) => return Ok(value),
            Ok(PollStatus::Failed(message)) => return Err(ServiceError::Application(message)),
            Ok(PollStatus::Pending) => {
                debug!(attempt, stage = label, "still pending");
            }
            Err(err) if err.is_transient() => {
                warn!(attempt, stage = label, error = %err, "status check failed");
            }
            Err(err) => return Err(err),
        }
        if attempt < attempts && !policy.interval.is_zero() {
            sleep(policy.interval).await;
        }
    }
    Err(ServiceError::Timeout { attempts })
}

/// Waits for a file produced by a remote service to show up on the shared
/// filesystem.
pub async fn wait_for_file(path: &Path, policy: &PollPolicy) -> ServiceResult<PathBuf> {
    let label = path.display().to_string();
    let result = poll_until(policy, &label, || async {
        if tokio::fs::metadata(path).await.is_ok() {
            Ok(PollStatus::Done(path.to_path_buf()))
        } else {
            Ok(PollStatus::Pending)
        }
    })
    .await;
    match result {
        Err(ServiceError::Timeout { .. }) => Err(ServiceError::MissingArtifact(path.to_path_buf())),
        other => other,
    }
}
