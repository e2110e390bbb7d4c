//! Resume/retry policy.
//!
//! Decides how long to wait between retries, when transient failures have
//! used up the retry budget and the action must be suspended, and when a
//! destination that keeps failing straight after a successful resume must be
//! given up on.

use std::time::{Duration, SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How many retries an action gets before it is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryBudget {
    /// Suspend once this many retries after the resume probe have failed
    Limited(u32),
    /// Never suspend because of the retry count alone
    Unlimited,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::Limited(0)
    }
}

impl RetryBudget {
    /// Build from a classic retry count where any negative value means "retry forever".
    #[must_use]
    pub fn from_count(count: i64) -> Self {
        u32::try_from(count).map_or_else(
            |_| {
                if count < 0 {
                    Self::Unlimited
                } else {
                    Self::Limited(u32::MAX)
                }
            },
            Self::Limited,
        )
    }

    /// Whether `failed` failed attempts use up the budget.
    ///
    /// The first attempt after a failure is the resume probe and is not a
    /// retry, so `Limited(n)` allows `n + 1` failed attempts before suspending.
    #[must_use]
    pub const fn is_exhausted(self, failed: u32) -> bool {
        match self {
            Self::Limited(limit) => failed > limit,
            Self::Unlimited => false,
        }
    }
}

/// Growth of the retry interval.
///
/// A fixed interval is the default. Exponential backoff is an opt-in
/// enhancement and has to be enabled explicitly per action.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum ResumeBackoff {
    #[default]
    Fixed,
    /// `interval * 2^(attempt - 1)`, capped at `max_interval_secs`, randomised by ±`jitter_factor`
    Exponential {
        max_interval_secs: u64,
        jitter_factor: f64,
    },
}

/// Retry configuration of one action, captured when the action is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePolicy {
    pub budget: RetryBudget,
    pub interval_secs: u64,
    pub flap_threshold: u32,
    pub backoff: ResumeBackoff,
}

impl ResumePolicy {
    /// Delay before the given (1-indexed) retry attempt or resume.
    #[must_use]
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        match self.backoff {
            ResumeBackoff::Fixed => Duration::from_secs(self.interval_secs),
            ResumeBackoff::Exponential {
                max_interval_secs,
                jitter_factor,
            } => Duration::from_secs(exponential_delay(
                attempt,
                self.interval_secs,
                max_interval_secs,
                jitter_factor,
            )),
        }
    }

    /// Whether the flapping counter has gone past the threshold
    #[must_use]
    pub const fn is_flapping(&self, resumes_in_row: u32) -> bool {
        resumes_in_row > self.flap_threshold
    }
}

/// `min(base * 2^(attempt - 1), max) * (1 ± jitter)`
fn exponential_delay(attempt: u32, base_secs: u64, max_secs: u64, jitter_factor: f64) -> u64 {
    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_secs
    } else {
        base_secs.saturating_mul(1u64 << exponent).min(max_secs)
    };

    if jitter_factor <= 0.0 {
        return delay;
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = {
        let range = (delay as f64) * jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        ((delay as f64) + jitter).max(0.0) as u64
    };

    jittered
}

/// What to do after a failed retry attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Stay in retry and try again after this long
    Wait(Duration),
    /// The budget is used up: suspend until the given deadline
    Suspend(SystemTime),
}

/// Retry bookkeeping of one action.
///
/// Only the controller mutates this, while holding the execution guard.
#[derive(Debug, Default, Clone)]
pub struct RetryTracker {
    /// Failed retries since the action was last suspended (or resumed)
    pub retries_since_suspend: u32,
    /// Resumes in a row that reported success but were followed by an immediate failure
    pub resume_ok_in_row: u32,
    /// Times the action has been suspended
    pub suspensions: u32,
    /// Earliest time for the next retry attempt
    pub retry_at: Option<SystemTime>,
    /// Earliest time to try resuming a suspended action
    pub resume_at: Option<SystemTime>,
    /// A resume succeeded and no delivery has confirmed it yet
    awaiting_confirmation: bool,
}

impl RetryTracker {
    /// A delivery failed transiently and the action enters retry.
    ///
    /// Returns `true` if the failure came right after a successful resume
    /// and pushes the flapping counter past the policy threshold.
    pub fn enter_retry(&mut self, now: SystemTime, policy: &ResumePolicy) -> bool {
        self.retry_at = Some(now);
        if std::mem::take(&mut self.awaiting_confirmation) {
            self.resume_ok_in_row += 1;
        }
        policy.is_flapping(self.resume_ok_in_row)
    }

    /// A resume attempt reported success.
    pub fn record_resumed(&mut self) {
        self.retries_since_suspend = 0;
        self.retry_at = None;
        self.resume_at = None;
        self.awaiting_confirmation = true;
    }

    /// A delivery went through.
    pub fn record_delivered(&mut self) {
        if std::mem::take(&mut self.awaiting_confirmation) {
            self.resume_ok_in_row = 0;
        }
    }

    /// A retry or resume attempt failed transiently.
    pub fn record_failed_attempt(&mut self, now: SystemTime, policy: &ResumePolicy) -> RetryVerdict {
        self.retries_since_suspend += 1;
        if policy.budget.is_exhausted(self.retries_since_suspend) {
            return RetryVerdict::Suspend(self.suspend(now, policy));
        }

        let wait = policy.retry_interval(self.retries_since_suspend);
        self.retry_at = Some(now + wait);
        RetryVerdict::Wait(wait)
    }

    /// Start a suspension and return its resume deadline.
    pub fn suspend(&mut self, now: SystemTime, policy: &ResumePolicy) -> SystemTime {
        self.suspensions += 1;
        self.retries_since_suspend = 0;
        self.retry_at = None;
        let deadline = now + policy.retry_interval(self.suspensions);
        self.resume_at = Some(deadline);
        deadline
    }
}
