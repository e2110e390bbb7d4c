//! Policy abstractions for action delivery.
//!
//! - [`ResumePolicy`]: retry budget, retry/resume timing and flapping threshold
//! - [`RetryTracker`]: the per-action counters the policy is applied to

pub mod resume;

pub use resume::{ResumeBackoff, ResumePolicy, RetryBudget, RetryTracker, RetryVerdict};
