//! Throttle and deduplication filter.
//!
//! Runs before every submission and decides whether this occurrence of a
//! record reaches the output module. The gates apply in order:
//!
//! 1. **Failover**: only pass while the previous action is suspended
//! 2. **Minimum interval**: at most one execution per configured interval,
//!    mark records may be exempt
//! 3. **Every n-th occurrence**: only every n-th record passes; counting
//!    restarts when occurrences stop arriving for the configured timeout
//! 4. **Repeat collapsing**: identical consecutive records are counted
//!    instead of delivered, and summarised once the run ends
//!
//! # Example
//!
//! ```text
//! exec_every_nth: 3, timeout: 60s
//!
//! t=0s   occurrence 1 → skipped (1/3)
//! t=5s   occurrence 2 → skipped (2/3)
//! t=9s   occurrence 3 → passes, counter back to 0
//! t=10s  occurrence 4 → skipped (1/3)
//! t=90s  occurrence 5 → passes (80s since the last one), counter back to 0
//! ```

use std::{sync::Arc, time::SystemTime};

use outflow_common::LogRecord;

use crate::{clock::elapsed_secs, config::ActionConfig};

/// Throttle settings taken from the action configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub exec_only_when_previous_suspended: bool,
    pub write_all_mark_messages: bool,
    pub exec_once_interval_secs: u64,
    pub exec_every_nth: u32,
    pub exec_every_nth_timeout_secs: u64,
    pub reduce_repeated: bool,
    pub repeated_msg_contains_original: bool,
}

impl From<&ActionConfig> for ThrottleConfig {
    fn from(config: &ActionConfig) -> Self {
        Self {
            exec_only_when_previous_suspended: config.exec_only_when_previous_suspended,
            write_all_mark_messages: config.write_all_mark_messages,
            exec_once_interval_secs: config.exec_once_interval_secs,
            exec_every_nth: config.exec_every_nth,
            exec_every_nth_timeout_secs: config.exec_every_nth_timeout_secs,
            reduce_repeated: config.reduce_repeated,
            repeated_msg_contains_original: config.repeated_msg_contains_original,
        }
    }
}

/// Why a record did not pass the filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Failover action and the previous action is not suspended
    PreviousActive,
    /// Minimum interval since the last execution has not passed
    Interval,
    /// Not the n-th occurrence yet
    Sampling,
    /// Repetition of the previous record, counted for the summary
    Repeated,
}

/// Filter decision for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver these records, in order (a pending repeat summary comes first)
    Pass(Vec<Arc<LogRecord>>),
    Skip(SkipReason),
}

/// Filter state as of some point, for undoing checks whose records were never submitted
#[derive(Debug, Clone)]
pub struct Checkpoint {
    last_exec: Option<SystemTime>,
    skipped_occurrences: u32,
    last_occurrence: Option<SystemTime>,
    previous: Option<Arc<LogRecord>>,
    repeat_count: u32,
}

/// Throttle and deduplication state of one action
#[derive(Debug, Default)]
pub struct ThrottleFilter {
    config: ThrottleConfig,
    last_exec: Option<SystemTime>,
    skipped_occurrences: u32,
    last_occurrence: Option<SystemTime>,
    previous: Option<Arc<LogRecord>>,
    repeat_count: u32,
}

impl ThrottleFilter {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Run `record` through every gate.
    ///
    /// `now` is the time cached for this execution pass, `previous_suspended`
    /// the current state of the action the failover gate watches.
    pub fn check(
        &mut self,
        record: &Arc<LogRecord>,
        now: SystemTime,
        previous_suspended: bool,
    ) -> Verdict {
        if self.config.exec_only_when_previous_suspended && !previous_suspended {
            return Verdict::Skip(SkipReason::PreviousActive);
        }

        if !self.interval_elapsed(record, now) {
            return Verdict::Skip(SkipReason::Interval);
        }

        if !self.sample(now) {
            return Verdict::Skip(SkipReason::Sampling);
        }

        let verdict = self.collapse(record);
        if matches!(verdict, Verdict::Pass(_)) {
            self.last_exec = Some(now);
        }
        verdict
    }

    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_exec: self.last_exec,
            skipped_occurrences: self.skipped_occurrences,
            last_occurrence: self.last_occurrence,
            previous: self.previous.clone(),
            repeat_count: self.repeat_count,
        }
    }

    /// Go back to `checkpoint`, so that passing records nobody took does not
    /// count as an execution and an owed summary stays owed.
    pub fn restore(&mut self, checkpoint: Checkpoint) {
        let Checkpoint {
            last_exec,
            skipped_occurrences,
            last_occurrence,
            previous,
            repeat_count,
        } = checkpoint;

        self.last_exec = last_exec;
        self.skipped_occurrences = skipped_occurrences;
        self.last_occurrence = last_occurrence;
        self.previous = previous;
        self.repeat_count = repeat_count;
    }

    /// Take the summary owed for a pending run of repeated records, if any.
    pub fn flush_repeated(&mut self) -> Option<Arc<LogRecord>> {
        if self.repeat_count == 0 {
            return None;
        }

        let count = std::mem::take(&mut self.repeat_count);
        self.previous.as_ref().map(|previous| {
            Arc::new(previous.repeated_summary(count, self.config.repeated_msg_contains_original))
        })
    }

    /// Occurrences skipped since the n-th counter was last reset
    #[must_use]
    pub const fn skipped_occurrences(&self) -> u32 {
        self.skipped_occurrences
    }

    /// Repetitions collapsed so far in the current run
    #[must_use]
    pub const fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    fn interval_elapsed(&self, record: &LogRecord, now: SystemTime) -> bool {
        if self.config.exec_once_interval_secs == 0
            || (record.is_mark && self.config.write_all_mark_messages)
        {
            return true;
        }

        self.last_exec.is_none_or(|last| {
            elapsed_secs(last, now) >= self.config.exec_once_interval_secs
        })
    }

    fn sample(&mut self, now: SystemTime) -> bool {
        if self.config.exec_every_nth <= 1 {
            return true;
        }

        let timed_out = self.config.exec_every_nth_timeout_secs > 0
            && self.last_occurrence.is_some_and(|last| {
                elapsed_secs(last, now) > self.config.exec_every_nth_timeout_secs
            });
        self.last_occurrence = Some(now);

        if timed_out {
            self.skipped_occurrences = 0;
            return true;
        }

        self.skipped_occurrences += 1;
        if self.skipped_occurrences >= self.config.exec_every_nth {
            self.skipped_occurrences = 0;
            true
        } else {
            false
        }
    }

    fn collapse(&mut self, record: &Arc<LogRecord>) -> Verdict {
        if !self.config.reduce_repeated {
            return Verdict::Pass(vec![Arc::clone(record)]);
        }

        if self
            .previous
            .as_ref()
            .is_some_and(|previous| record.is_repeat_of(previous))
        {
            self.repeat_count += 1;
            return Verdict::Skip(SkipReason::Repeated);
        }

        let mut batch = Vec::with_capacity(2);
        batch.extend(self.flush_repeated());
        batch.push(Arc::clone(record));
        self.previous = Some(Arc::clone(record));
        Verdict::Pass(batch)
    }
}
