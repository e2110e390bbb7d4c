//! The log record delivered to actions.

use core::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Message text used for periodic heartbeat records.
pub const MARK_MESSAGE: &str = "-- MARK --";

/// Longest slice of the original message embedded in a repeat summary.
const SUMMARY_EXCERPT_LEN: usize = 800;

/// Facility used for records the daemon produces itself.
const INTERNAL_FACILITY: u8 = 5;

/// Syslog severity of a record
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Informational = 6,
    Debug = 7,
}

impl Severity {
    /// Numeric syslog severity
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    const fn from_code(code: u8) -> Self {
        match code & 0x07 {
            0 => Self::Emergency,
            1 => Self::Alert,
            2 => Self::Critical,
            3 => Self::Error,
            4 => Self::Warning,
            5 => Self::Notice,
            6 => Self::Informational,
            _ => Self::Debug,
        }
    }
}

impl Display for Severity {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Emergency => "emerg",
            Self::Alert => "alert",
            Self::Critical => "crit",
            Self::Error => "err",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Informational => "info",
            Self::Debug => "debug",
        })
    }
}

/// A processed log record, ready to be handed to an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub tag: String,
    pub message: String,
    pub severity: Severity,
    pub facility: u8,
    /// Periodic heartbeat record, exempt from minimum-interval throttling when configured
    #[serde(default)]
    pub is_mark: bool,
}

impl LogRecord {
    /// Create a user-level informational record stamped with the current time
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        tag: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            hostname: hostname.into(),
            tag: tag.into(),
            message: message.into(),
            severity: Severity::Informational,
            facility: 1,
            is_mark: false,
        }
    }

    /// Create a heartbeat record
    #[must_use]
    pub fn mark(hostname: impl Into<String>) -> Self {
        Self {
            facility: INTERNAL_FACILITY,
            is_mark: true,
            ..Self::new(hostname, "", MARK_MESSAGE)
        }
    }

    /// Parse a line in the form `[<PRI>][TAG: ]MESSAGE`.
    ///
    /// A tag is only recognised when the text before the first `:` holds no
    /// whitespace, which keeps messages such as `disk full: /var` intact.
    ///
    /// # Errors
    ///
    /// Returns an error if a `<PRI>` prefix is present but malformed.
    pub fn parse_line(hostname: &str, line: &str) -> Result<Self, RecordError> {
        let mut record = Self::new(hostname, "", "");
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>').ok_or(RecordError::UnterminatedPriority)?;
            let pri = &stripped[..end];
            let value = pri
                .parse::<u8>()
                .ok()
                .filter(|value| *value <= 191)
                .ok_or_else(|| RecordError::InvalidPriority(pri.to_string()))?;
            record.facility = value >> 3;
            record.severity = Severity::from_code(value);
            rest = &stripped[end + 1..];
        }

        if let Some((tag, message)) = rest.split_once(": ")
            && !tag.is_empty()
            && !tag.contains(char::is_whitespace)
        {
            record.tag = format!("{tag}:");
            record.message = format!(" {message}");
        } else {
            record.message = rest.to_string();
        }

        Ok(record)
    }

    /// Syslog PRI value
    #[must_use]
    pub const fn pri(&self) -> u16 {
        (self.facility as u16) * 8 + self.severity.code() as u16
    }

    /// Whether `other` counts as a repetition of this record for repeat collapsing
    #[must_use]
    pub fn is_repeat_of(&self, other: &Self) -> bool {
        self.message == other.message && self.hostname == other.hostname && self.tag == other.tag
    }

    /// Build the synthetic "repeated N times" record summarising collapsed repetitions
    #[must_use]
    pub fn repeated_summary(&self, count: u32, include_original: bool) -> Self {
        let message = if include_original {
            let excerpt = self
                .message
                .char_indices()
                .nth(SUMMARY_EXCERPT_LEN)
                .map_or(self.message.as_str(), |(idx, _)| &self.message[..idx]);
            format!("message repeated {count} times: [{excerpt}]")
        } else {
            format!("last message repeated {count} times")
        };

        Self {
            timestamp: Utc::now(),
            message,
            is_mark: false,
            ..self.clone()
        }
    }
}
