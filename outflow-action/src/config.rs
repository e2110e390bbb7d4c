//! Per-action configuration.
//!
//! Every field has a default, so a configuration only needs to name what it
//! changes:
//! ```ron
//! (
//!     resume_retry_count: Some(Unlimited),
//!     resume_interval_secs: 10,
//!     reduce_repeated: true,
//!     queue: Memory(capacity: 10000),
//! )
//! ```

use serde::{Deserialize, Serialize};

use crate::{
    policy::{ResumeBackoff, RetryBudget},
    template::{DEFAULT_TEMPLATE, ParamPassing},
};

const fn default_resume_interval() -> u64 {
    30
}

const fn default_flap_threshold() -> u32 {
    10
}

const fn default_queue_capacity() -> usize {
    1000
}

fn default_templates() -> Vec<String> {
    vec![DEFAULT_TEMPLATE.to_string()]
}

/// How batches reach the output module
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueConfig {
    /// Deliver synchronously on the submitting thread
    #[default]
    Direct,
    /// Bounded in-memory queue drained by a dedicated worker thread
    Memory {
        #[serde(default = "default_queue_capacity")]
        capacity: usize,
    },
}

/// Configuration of one action, immutable once the action is bound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Only execute while the previous action is suspended (failover)
    #[serde(default)]
    pub exec_only_when_previous_suspended: bool,

    /// Mark records bypass the minimum execution interval
    #[serde(default)]
    pub write_all_mark_messages: bool,

    /// Minimum seconds between two executions, 0 disables the gate
    #[serde(default)]
    pub exec_once_interval_secs: u64,

    /// Execute only every n-th occurrence (0 and 1 mean always)
    #[serde(default)]
    pub exec_every_nth: u32,

    /// Seconds without an occurrence after which n-th counting restarts, 0 disables
    #[serde(default)]
    pub exec_every_nth_timeout_secs: u64,

    /// Retries before suspension, `None` uses the registry default
    #[serde(default)]
    pub resume_retry_count: Option<RetryBudget>,

    /// Seconds between retries, and the length of a suspension
    ///
    /// Default: 30 seconds
    #[serde(default = "default_resume_interval")]
    pub resume_interval_secs: u64,

    /// Immediate failures after a successful resume tolerated before the action is disabled
    ///
    /// Default: 10
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: u32,

    /// Growth of the retry interval, fixed unless configured otherwise
    #[serde(default)]
    pub backoff: ResumeBackoff,

    /// Collapse identical consecutive records into a "repeated N times" summary
    #[serde(default)]
    pub reduce_repeated: bool,

    /// Whether the repeat summary embeds the original message
    #[serde(default)]
    pub repeated_msg_contains_original: bool,

    /// Templates rendered for the output module, in order
    #[serde(default = "default_templates")]
    pub templates: Vec<String>,

    #[serde(default)]
    pub param_passing: ParamPassing,

    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            exec_only_when_previous_suspended: false,
            write_all_mark_messages: false,
            exec_once_interval_secs: 0,
            exec_every_nth: 0,
            exec_every_nth_timeout_secs: 0,
            resume_retry_count: None,
            resume_interval_secs: default_resume_interval(),
            flap_threshold: default_flap_threshold(),
            backoff: ResumeBackoff::default(),
            reduce_repeated: false,
            repeated_msg_contains_original: false,
            templates: default_templates(),
            param_passing: ParamPassing::default(),
            queue: QueueConfig::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: ActionConfig = ron::from_str("()").unwrap();
        assert_eq!(config, ActionConfig::default());
        assert_eq!(config.resume_interval_secs, 30);
        assert_eq!(config.templates, vec![DEFAULT_TEMPLATE.to_string()]);
    }

    #[test]
    fn test_config_overrides() {
        let config: ActionConfig = ron::from_str(
            r#"(
                exec_every_nth: 3,
                resume_retry_count: Some(Unlimited),
                backoff: Exponential(max_interval_secs: 600, jitter_factor: 0.1),
                param_passing: Array,
                queue: Memory(capacity: 64),
            )"#,
        )
        .unwrap();

        assert_eq!(config.exec_every_nth, 3);
        assert_eq!(config.resume_retry_count, Some(RetryBudget::Unlimited));
        assert_eq!(config.param_passing, ParamPassing::Array);
        assert_eq!(config.queue, QueueConfig::Memory { capacity: 64 });
        assert!(matches!(
            config.backoff,
            ResumeBackoff::Exponential {
                max_interval_secs: 600,
                ..
            }
        ));
    }
}
