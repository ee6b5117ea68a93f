//! Bounded retry for transient container errors
//!
//! Lock contention inside a container surfaces as `Error::Deadlock`. Callers
//! wrap container work in [`retry_on_deadlock`], which retries with capped
//! exponential backoff and gives up after `max_retries` further attempts.
//! Every other error is returned immediately.

use cairn_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for deadlock retry behavior
///
/// # Example
/// ```
/// use cairn_storage::RetryConfig;
///
/// let config = RetryConfig::new()
///     .with_max_retries(5)
///     .with_base_delay_ms(10)
///     .with_max_delay_ms(200);
/// assert_eq!(config.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: usize,
    /// Base delay between retries in milliseconds (exponential backoff)
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 5,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Create a new RetryConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a RetryConfig with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    /// Set maximum delay between retries
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        // 1 << 63 is the largest shift that fits in u64
        let shift = attempt.min(63);
        let multiplier = 1u64 << shift;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Run `f`, retrying while it fails with `Error::Deadlock`
///
/// `context` names the operation in logs and in the final error. When the
/// retries are exhausted the returned `Deadlock` carries the total number of
/// attempts made.
pub fn retry_on_deadlock<T, F>(config: &RetryConfig, context: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if e.is_transient() => {
                if attempt >= config.max_retries {
                    warn!(
                        context,
                        attempts = attempt + 1,
                        "Giving up after repeated deadlocks"
                    );
                    return Err(Error::Deadlock {
                        context: context.to_string(),
                        attempts: attempt + 1,
                    });
                }
                let delay = config.calculate_delay(attempt);
                info!(
                    context,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying operation aborted by deadlock"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}
