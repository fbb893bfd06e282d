//! High-level application primitives.
//!
//! This crate provides the pieces a worker binary needs before it starts running jobs, such as initializing logging and
//! writing its PID file.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod bootstrap;
pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::bootstrap::update_pid_file;
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration, LoggingGuard};
}
