use crate::error::StepErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-step retry policy: which failures are recoverable, how many retries,
/// and the capped exponential backoff between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
    /// Error kinds treated as recoverable
    pub retry_on: Vec<StepErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            retry_on: vec![StepErrorKind::Transient, StepErrorKind::Timeout],
        }
    }
}

impl RetryPolicy {
    /// Policy retrying the default recoverable kinds
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Fail on the first error of any kind
    #[must_use]
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            retry_on: Vec::new(),
            ..Self::default()
        }
    }

    /// Replace the recoverable kinds
    #[inline]
    #[must_use]
    pub fn with_retry_on(mut self, kinds: impl IntoIterator<Item = StepErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    /// Whether `kind` may be retried
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self, kind: StepErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Delay before retry number `retry` (0-based): base × 2^retry, capped.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let cap = self.max_delay_ms;
        let millis = 2u64
            .checked_pow(retry)
            .and_then(|factor| self.base_delay_ms.checked_mul(factor))
            .map_or(cap, |ms| ms.min(cap));
        Duration::from_millis(millis)
    }

    /// Reject a base delay above the cap.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "base delay {}ms exceeds cap {}ms",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        Ok(())
    }
}
