//! Result and diagnostic types shared across the action.

use std::time::SystemTime;

use crate::state::ActionState;

/// What became of a submitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Delivered, or queued for delivery
    Accepted,
    /// Dropped by the throttle filter
    Skipped,
    /// Not delivered now: the action is suspended or its queue is full
    Deferred,
    /// The action is permanently disabled
    Disabled,
}

/// Snapshot of an action's state and counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionStats {
    pub name: String,
    pub state: ActionState,
    pub retries_since_suspend: u32,
    pub resume_ok_in_row: u32,
    pub suspensions: u32,
    /// Earliest time a suspended action tries to resume
    pub resume_at: Option<SystemTime>,
    /// Records the output module accepted
    pub delivered: u64,
    /// Failed calls into the output module
    pub failures: u64,
    pub skipped_occurrences: u32,
    pub repeat_count: u32,
}
