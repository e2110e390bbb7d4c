//! Typed error handling for action delivery.
//!
//! This module classifies every adapter and queue outcome before a caller
//! sees it:
//! - Transient failures drive the action into retry
//! - Fatal failures disable the action permanently
//! - Shutdown aborts are never counted as destination failures
//! - Configuration errors keep an action from ever becoming usable

use thiserror::Error;

/// Errors raised while binding an action, before it can accept records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// No output module was bound to the action.
    #[error("No output module bound to action {0}")]
    MissingModule(String),

    /// A template referenced by the action does not exist.
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// The failover gate is enabled but there is no previous action to watch.
    #[error("Action {0} executes only when the previous action is suspended, but has no previous action")]
    MissingPrevious(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    /// The output module refused the binding.
    #[error("Output module rejected binding: {0}")]
    ModuleRejected(String),

    /// The worker thread of a memory queue could not be started.
    #[error("Failed to start queue worker: {0}")]
    QueueWorker(String),

    /// The registry-wide resume retry default was already set.
    #[error("Resume retry default already set")]
    DefaultAlreadySet,

    /// The registry-wide resume retry default was set after an action was bound.
    #[error("Resume retry default must be set before any action is bound")]
    DefaultAfterBind,

    /// `new_scope` was called while another scope is still open.
    #[error("A configuration scope is already open")]
    ScopeAlreadyOpen,

    /// `restore_scope` or `abandon_scope` was called without an open scope.
    #[error("No configuration scope is open")]
    NoOpenScope,
}

/// Outcome of a failed call into an output module.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModuleError {
    /// Recoverable failure (network blip, temporary disk full, ...).
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure (bad configuration, missing credentials, ...).
    #[error("Fatal failure: {0}")]
    Fatal(String),
}

impl ModuleError {
    /// Returns `true` if the failure may clear up on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Top-level action error type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    /// The module or queue reported a recoverable failure.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Transient failures outlasted the retry budget.
    #[error("Retry budget exhausted after {retries} retries")]
    BudgetExhausted { retries: u32 },

    /// The destination kept failing straight after reporting a successful resume.
    #[error("Destination is flapping: {resumes} resumes in a row failed immediately")]
    Flapping { resumes: u32 },

    /// The module reported an unrecoverable failure.
    #[error("Fatal failure: {0}")]
    Fatal(String),

    /// The submission was abandoned because the process is shutting down.
    #[error("Submission aborted by shutdown")]
    ShutdownAbort,

    /// The action is permanently disabled.
    #[error("Action is disabled")]
    Disabled,

    /// Binding the action failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ActionError {
    /// Returns `true` if this is a shutdown abort.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShutdownAbort)
    }

    /// Returns `true` if this error should put the action into retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if this error disables the action permanently.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Flapping { .. } | Self::Disabled)
    }
}

impl From<ModuleError> for ActionError {
    fn from(error: ModuleError) -> Self {
        match error {
            ModuleError::Transient(msg) => Self::Transient(msg),
            ModuleError::Fatal(msg) => Self::Fatal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_error_conversion() {
        let error: ActionError = ModuleError::Transient("connection refused".to_string()).into();
        assert!(error.is_transient());
        assert!(!error.is_permanent());

        let error: ActionError = ModuleError::Fatal("bad credentials".to_string()).into();
        assert!(error.is_permanent());
        assert!(!error.is_transient());
    }

    #[test]
    fn test_shutdown_is_neither_transient_nor_permanent() {
        let error = ActionError::ShutdownAbort;
        assert!(error.is_shutdown());
        assert!(!error.is_transient());
        assert!(!error.is_permanent());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ActionError::BudgetExhausted { retries: 3 }.to_string(),
            "Retry budget exhausted after 3 retries"
        );
        assert_eq!(
            ActionError::from(ConfigError::UnknownTemplate("fwd".to_string())).to_string(),
            "Configuration error: Unknown template: fwd"
        );
    }
}
