use crate::{error::ModuleError, module::OutputModule, template::ActionParams};

/// Drops every record. Useful as the last action of a chain.
#[derive(Debug, Default)]
pub struct DiscardOutput;

impl OutputModule for DiscardOutput {
    fn name(&self) -> &str {
        "discard"
    }

    fn deliver(&mut self, _params: &ActionParams) -> Result<(), ModuleError> {
        Ok(())
    }
}
