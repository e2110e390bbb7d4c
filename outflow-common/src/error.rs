//! Error types for the outflow-common crate.

use thiserror::Error;

/// Errors that can occur while turning raw input into a [`LogRecord`](crate::LogRecord).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    /// The `<PRI>` prefix was not terminated by `>`.
    #[error("Unterminated priority prefix")]
    UnterminatedPriority,

    /// The `<PRI>` prefix held something other than a priority in `0..=191`.
    #[error("Invalid priority: {0}")]
    InvalidPriority(String),
}
