//! Readiness polling for a freshly spawned backend
//!
//! The poller retries a cheap probe with a linearly growing delay until it
//! succeeds, the optional deadline passes, or the caller reports that the
//! backend process is gone.

use crate::pool::ConnectionPool;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Linear backoff between readiness probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Added to the delay after every further failed attempt
    pub step: Duration,
    /// Upper bound for a single delay
    pub max_delay: Option<Duration>,
    /// Give up once this much time has passed
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear()
    }
}

impl RetryPolicy {
    /// One second, then two, then three... with no ceiling
    pub fn linear() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            step: Duration::from_secs(1),
            max_delay: None,
            deadline: None,
        }
    }

    /// Delay to wait after `failed` previous failures (0-based)
    pub fn delay_for(&self, failed: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_add(self.step.saturating_mul(failed));
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Why polling stopped without success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The fatal check fired (the process exited)
    Fatal { attempts: u32 },
    /// The policy deadline passed
    DeadlineExceeded { attempts: u32, elapsed: Duration },
}

/// Retry `attempt` until it returns true.
///
/// `is_fatal` is consulted before every attempt and right after every
/// failure, so a dead process never costs another delay. Returns the
/// number of attempts made.
pub async fn poll<A, Fut, F>(
    policy: &RetryPolicy,
    mut attempt: A,
    mut is_fatal: F,
) -> Result<u32, PollError>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        if is_fatal() {
            return Err(PollError::Fatal { attempts });
        }

        attempts += 1;
        if attempt().await {
            return Ok(attempts);
        }

        if is_fatal() {
            return Err(PollError::Fatal { attempts });
        }

        let mut delay = policy.delay_for(attempts - 1);
        if let Some(deadline) = policy.deadline {
            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(PollError::DeadlineExceeded { attempts, elapsed });
            }
            delay = delay.min(deadline - elapsed);
        }

        debug!(attempts, delay_ms = delay.as_millis() as u64, "Backend not ready, retrying");
        tokio::time::sleep(delay).await;
    }
}

/// Probe `authority` once: any HTTP response means the backend is listening
pub async fn probe(pool: &ConnectionPool, authority: &str, path: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, pool.check_backend(authority, path)).await,
        Ok(true)
    )
}
