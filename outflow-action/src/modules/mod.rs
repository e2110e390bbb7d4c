//! Built-in output modules

pub mod discard;
pub mod file;

pub use discard::DiscardOutput;
pub use file::FileOutput;
