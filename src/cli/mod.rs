//! CLI-specific functionality for the `jumphost` binary
//!
//! Argument parsing lives here; configuration discovery is shared with the
//! library in [`crate::config`].

pub mod args;

pub use args::{Args, Commands, GlobalOptions, Invocation, OperationCall, Target};
pub use crate::config::ConfigDiscovery;
