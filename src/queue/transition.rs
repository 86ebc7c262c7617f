//! Job lifecycle as explicit state transitions.
//!
//! ```text
//! PENDING --lease--> RUNNING --complete--> SUCCEEDED
//! RUNNING --fail (retryable, attempt < ceiling)--> PENDING (attempt + 1)
//! RUNNING --fail (otherwise)--> FAILED
//! RUNNING --lease expired--> same rule as fail with infra_error
//! PENDING --batch cancelled--> CANCELLED
//! RUNNING (cancel requested) --any outcome--> CANCELLED
//! ```

use crate::backtest::model::ErrorCategory;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    Requeue { next_attempt: i32 },
    Fail,
    Cancel,
}

impl FailureTransition {
    pub fn status(&self) -> JobStatus {
        match self {
            FailureTransition::Requeue { .. } => JobStatus::Pending,
            FailureTransition::Fail => JobStatus::Failed,
            FailureTransition::Cancel => JobStatus::Cancelled,
        }
    }
}

/// Where a RUNNING job goes after a failed attempt (worker `fail` or lease expiry).
pub fn after_failure(
    attempt_count: i32,
    max_attempts: i32,
    cancel_requested: bool,
    category: ErrorCategory,
) -> FailureTransition {
    if cancel_requested {
        return FailureTransition::Cancel;
    }
    if category.retryable() && attempt_count < category.attempt_ceiling(max_attempts) {
        FailureTransition::Requeue {
            next_attempt: attempt_count + 1,
        }
    } else {
        FailureTransition::Fail
    }
}

pub fn after_success(cancel_requested: bool) -> JobStatus {
    if cancel_requested {
        JobStatus::Cancelled
    } else {
        JobStatus::Succeeded
    }
}

/// Delay before a requeued job becomes leasable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Exponential back-off (base * 2^(retry-1), capped) with 0~20% jitter.
    pub fn delay_for(&self, next_attempt: i32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = (next_attempt - 2).clamp(0, 10) as u32;
        let mut delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay.max(self.base_delay));
        if self.jitter {
            let pct: u32 = rand::thread_rng().gen_range(0..=20);
            delay += delay * pct / 100;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_failure_requeues_until_ceiling() {
        assert_eq!(
            after_failure(1, 3, false, ErrorCategory::InfraError),
            FailureTransition::Requeue { next_attempt: 2 }
        );
        assert_eq!(
            after_failure(2, 3, false, ErrorCategory::Timeout),
            FailureTransition::Requeue { next_attempt: 3 }
        );
        assert_eq!(
            after_failure(3, 3, false, ErrorCategory::InfraError),
            FailureTransition::Fail
        );
    }

    #[test]
    fn test_execution_error_is_retried_once() {
        assert_eq!(
            after_failure(1, 5, false, ErrorCategory::ExecutionError),
            FailureTransition::Requeue { next_attempt: 2 }
        );
        assert_eq!(
            after_failure(2, 5, false, ErrorCategory::ExecutionError),
            FailureTransition::Fail
        );
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        assert_eq!(
            after_failure(1, 5, false, ErrorCategory::DataUnavailable),
            FailureTransition::Fail
        );
        assert_eq!(
            after_failure(1, 5, false, ErrorCategory::MalformedResult),
            FailureTransition::Fail
        );
    }

    #[test]
    fn test_cancel_request_wins_over_retry() {
        let t = after_failure(1, 3, true, ErrorCategory::InfraError);
        assert_eq!(t, FailureTransition::Cancel);
        assert_eq!(t.status(), JobStatus::Cancelled);
        assert_eq!(after_success(true), JobStatus::Cancelled);
        assert_eq!(after_success(false), JobStatus::Succeeded);
    }

    #[test]
    fn test_retry_policy_backoff() {
        assert_eq!(RetryPolicy::immediate().delay_for(4), Duration::ZERO);

        let policy = RetryPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(policy.delay_for(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));

        let jittered = RetryPolicy::exponential(Duration::from_secs(10), Duration::from_secs(60));
        let d = jittered.delay_for(2);
        assert!(d >= Duration::from_secs(10) && d <= Duration::from_secs(12));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
