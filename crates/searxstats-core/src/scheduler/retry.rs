//! Retry ceiling, exponential backoff and circuit rotation limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::check::{CheckOutcome, FailureKind, FailureReason};
use crate::error::{ConfigError, ConfigResult};

/// Retry controls for one (instance, check kind) task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = never retry).
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound for any single delay (milliseconds).
    pub backoff_max_ms: u64,
    /// Circuit rotations allowed before a blocked task gives up.
    pub max_rotations: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            max_rotations: 2,
        }
    }
}

/// What to do after an attempt produced `outcome`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Record this outcome as the final result.
    Finish(CheckOutcome),
    /// Try again after `delay`, rotating the circuit first if asked.
    Retry { delay: Duration, rotate: bool },
}

impl RetryPolicy {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.retry.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.retry.backoff_max_ms".to_string(),
                reason: format!("must be >= backoff_base_ms ({})", self.backoff_base_ms),
            });
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, after attempt number `attempt` failed.
    ///
    /// `min(base * 2^(attempt-1), max)`; non-decreasing in `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Decide the fate of a task whose attempt number `attempt` produced
    /// `outcome`, having already rotated its circuit `rotations` times.
    pub fn decide(&self, outcome: CheckOutcome, attempt: u32, rotations: u32) -> RetryDecision {
        let reason = match &outcome {
            CheckOutcome::Success(_) | CheckOutcome::HardFailure(_) => {
                return RetryDecision::Finish(outcome)
            }
            CheckOutcome::SoftFailure(reason) => reason.clone(),
        };

        let blocked = reason.kind == FailureKind::Blocked;
        if blocked && rotations >= self.max_rotations {
            return RetryDecision::Finish(CheckOutcome::HardFailure(FailureReason::new(
                FailureKind::Blocked,
                format!("{} (still blocked after {rotations} circuit rotations)", reason.message),
            )));
        }

        if attempt >= self.max_attempts {
            let message = format!("{} (gave up after {attempt} attempts)", reason.message);
            let reason = FailureReason::new(reason.kind, message);
            return RetryDecision::Finish(if reason.kind.escalates_on_exhaustion() {
                CheckOutcome::HardFailure(reason)
            } else {
                CheckOutcome::SoftFailure(reason)
            });
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt),
            rotate: blocked,
        }
    }
}
