//! The outflow daemon: reads records, hands them to every configured action
//! and swaps the action set when the configuration is reloaded.

pub mod config;
pub mod daemon;

pub use config::{ActionDefinition, DaemonConfig, OutputKind, find_config_file, with_previous};
pub use daemon::Daemon;
