//! Action delivery engine for the outflow log daemon
//!
//! This crate provides:
//! - The per-destination action and the state machine that drives it
//! - Retry, suspension and flapping detection for failing destinations
//! - Throttling and collapsing of repeated records
//! - Direct and in-memory queued submission
//! - A versioned registry that swaps action sets on reload

mod action;
pub mod clock;
mod config;
mod controller;
mod error;
pub mod module;
pub mod modules;
pub mod policy;
pub mod queue;
mod registry;
pub mod shutdown;
pub mod state;
pub mod template;
pub mod throttle;
mod types;

// Re-export the action surface
pub use action::{Action, ActionBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ActionConfig, QueueConfig};
pub use controller::{BatchOutcome, Controller};
// Re-export error types
pub use error::{ActionError, ConfigError, ModuleError};
pub use module::{BindContext, OutputModule};
pub use policy::{ResumeBackoff, ResumePolicy, RetryBudget};
pub use registry::{ActionDefaults, ActionRegistry, Generation};
pub use shutdown::ShutdownSignal;
pub use state::{ActionState, AtomicState, StateHandle};
pub use template::{ActionParams, ParamPassing, Template, TemplateRegistry};
pub use types::{ActionStats, Disposition};
