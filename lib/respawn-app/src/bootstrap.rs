//! Bootstrap utilities.

use std::path::Path;

use respawn_error::{ErrorContext as _, GenericError};

/// Writes the current process ID to the specified file.
///
/// A process manager reads this file to find the worker it has to replace once the worker exits.
///
/// # Errors
///
/// If the PID cannot be written to the file, an error is returned.
pub fn update_pid_file<P: AsRef<Path>>(pid_file: P) -> Result<(), GenericError> {
    let pid_file = pid_file.as_ref();
    let pid_string = std::process::id().to_string();

    std::fs::write(pid_file, pid_string)
        .with_error_context(|| format!("Failed to write PID file '{}'.", pid_file.display()))
}
