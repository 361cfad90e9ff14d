//! Retry policy shared by every remote call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// How many times an operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    /// At most this many attempts (always at least one).
    Limited(u32),
    /// Keep trying until the operation succeeds.
    Unbounded,
}

/// Fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: Attempts,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Build from a signed attempt count: negative retries forever, `0` and `1` try once.
    pub fn from_count(count: i32, delay: Duration) -> Self {
        let attempts = match count {
            n if n < 0 => Attempts::Unbounded,
            0 | 1 => Attempts::Limited(1),
            n => Attempts::Limited(n.unsigned_abs()),
        };
        Self { attempts, delay }
    }

    /// A single attempt, no delay.
    pub fn once() -> Self {
        Self {
            attempts: Attempts::Limited(1),
            delay: Duration::ZERO,
        }
    }

    /// Whether attempt number `attempt` (1-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.attempts {
            Attempts::Unbounded => true,
            Attempts::Limited(max) => attempt <= max.max(1),
        }
    }
}

/// Run `op` until it succeeds or the policy is out of attempts, returning the last error.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let next = attempt.saturating_add(1);
                if !policy.allows(next) {
                    return Err(e);
                }
                warn!(
                    target_url = label,
                    attempt,
                    error = %e,
                    "Request failed, retrying in {:?}",
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt = next;
            }
        }
    }
}
