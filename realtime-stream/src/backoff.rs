//! Reconnection backoff policy
//!
//! A pure mapping from the number of failed attempts to the delay before the
//! next one. Both behaviours observed across the stream clients (capped
//! exponential growth, and a fixed retry interval) are knobs of the same
//! policy rather than separate implementations.

use std::time::Duration;

use crate::error::{StreamError, StreamResult};

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default upper bound for exponential growth
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// How the delay grows between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackoffStrategy {
    /// `min(base * 2^attempt, cap)`
    Exponential,
    /// Always `base`
    Fixed,
}

/// Delay policy consulted by the connection manager after an abnormal close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Growth strategy
    pub strategy: BackoffStrategy,
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound applied to exponential growth
    pub cap: Duration,
    /// Stop scheduling retries after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base: DEFAULT_BASE_DELAY,
            cap: DEFAULT_MAX_DELAY,
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// Exponential policy with the given base and cap, retrying forever.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            cap,
            max_attempts: None,
        }
    }

    /// Fixed-interval policy, retrying forever.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base: interval,
            cap: interval,
            max_attempts: None,
        }
    }

    /// Limit the number of scheduled retries.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base,
            BackoffStrategy::Exponential => {
                if attempt >= 32 {
                    return self.cap;
                }
                self.base
                    .checked_mul(1u32 << attempt)
                    .map_or(self.cap, |delay| delay.min(self.cap))
            }
        }
    }

    /// Whether `attempt` retries have already been used up.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(false, |max| attempt >= max)
    }

    /// Validate the policy.
    pub fn validate(&self) -> StreamResult<()> {
        if self.base.is_zero() {
            return Err(StreamError::Configuration(
                "Backoff base delay must be greater than 0".to_string(),
            ));
        }

        if self.strategy == BackoffStrategy::Exponential && self.cap < self.base {
            return Err(StreamError::Configuration(
                "Backoff cap must not be smaller than the base delay".to_string(),
            ));
        }

        Ok(())
    }
}

/// Reconnection bookkeeping owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectAttempt {
    /// Number of retries scheduled since the last successful connect
    pub count: u32,
    /// Delay the next retry will use
    pub next_delay: Duration,
}

impl ReconnectAttempt {
    /// Fresh bookkeeping: `{0, base}`.
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            count: 0,
            next_delay: policy.delay(0),
        }
    }

    /// Reset after a successful connect.
    pub fn reset(&mut self, policy: &BackoffPolicy) {
        *self = Self::new(policy);
    }

    /// Consume one retry, returning the delay to wait before it.
    pub fn advance(&mut self, policy: &BackoffPolicy) -> Duration {
        let delay = policy.delay(self.count);
        self.count = self.count.saturating_add(1);
        self.next_delay = policy.delay(self.count);
        delay
    }
}
