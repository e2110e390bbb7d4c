//! Types shared by every outflow crate: the log record handed to actions and
//! the logging setup used by the daemon.

pub mod error;
pub mod logging;
pub mod record;

pub use error::RecordError;
pub use record::{LogRecord, Severity};
pub use tracing;
