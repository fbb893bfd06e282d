//! Logging.
//!
//! Standard output carries the job protocol, so every log line goes to standard error.

use respawn_error::{generic_error, GenericError};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, Layer};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

/// Keeps the background log writer alive.
///
/// Buffered log lines are flushed when the guard is dropped, so it should be held until the process exits.
#[must_use = "dropping the guard stops the log writer"]
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<LoggingGuard, GenericError> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = config.log_level.as_env_filter();

    let result = if config.log_format_json {
        tracing_subscriber::registry()
            .with(json_layer(writer).with_filter(filter))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(pretty_layer(writer).with_filter(filter))
            .try_init()
    };
    result.map_err(|e| generic_error!("Failed to initialize logging: {}", e))?;

    Ok(LoggingGuard { _writer: guard })
}

fn json_layer<S>(writer: tracing_appender::non_blocking::NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_current_span(true)
        .with_writer(writer)
}

fn pretty_layer<S>(writer: tracing_appender::non_blocking::NonBlocking) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
}
