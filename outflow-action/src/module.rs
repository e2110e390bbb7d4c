//! Output module capability.
//!
//! An output module performs the actual delivery to one destination. The
//! action owns its module through the execution guard, so a module is never
//! entered by two threads at once and needs no locking of its own. Whatever
//! private state the module keeps is released when the action is destructed.

use crate::{
    error::{ConfigError, ModuleError},
    template::ActionParams,
};

/// What an output module learns about the action it is bound to
#[derive(Debug, Clone)]
pub struct BindContext {
    pub action_name: String,
    /// Names of the templates the module will receive, in order
    pub templates: Vec<String>,
    /// Whether batches reach the module through a queue worker
    pub queued: bool,
}

pub trait OutputModule: Send + std::fmt::Debug {
    /// Short module name used in diagnostics
    fn name(&self) -> &str;

    /// Bind to an action. Called once, while the action is finalized.
    ///
    /// # Errors
    ///
    /// Returns an error if the module cannot work with this binding.
    fn construct(&mut self, _context: &BindContext) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Whether records are grouped into transactions closed by [`commit`](Self::commit)
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination cannot start a transaction.
    fn begin_transaction(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Deliver one record.
    ///
    /// # Errors
    ///
    /// Returns a transient error to have the action retry, a fatal one to disable it.
    fn deliver(&mut self, params: &ActionParams) -> Result<(), ModuleError>;

    /// Commit the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction could not be committed.
    fn commit(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Probe whether the destination is usable again.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination is still unavailable.
    fn try_resume(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// React to a reload signal, e.g. reopen a rotated file.
    ///
    /// # Errors
    ///
    /// Returns an error if the module could not reload.
    fn on_reload_signal(&mut self) -> Result<(), ModuleError> {
        Ok(())
    }
}
