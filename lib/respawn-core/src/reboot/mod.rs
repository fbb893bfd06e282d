//! Reboot strategies.
//!
//! After every completed job, the supervisor asks its reboot strategy whether the worker process should be replaced.
//! Strategies are stateful (a job counter, for example) and are only ever evaluated from the supervisor's event loop,
//! one completed job at a time, so they need no internal synchronization.

use snafu::Snafu;

use crate::job::JobOutcome;

mod always;
pub use self::always::Always;

mod chain;
pub use self::chain::Chain;

mod config;
pub use self::config::{CustomStrategies, RebootConfiguration, StrategyFactory};

mod max_jobs;
pub use self::max_jobs::MaxJobs;

mod on_exception;
pub use self::on_exception::OnException;

/// Strategy error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum StrategyError {
    /// The job limit was zero.
    #[snafu(display("Job limit must be at least 1, got {}.", max_jobs))]
    InvalidMaxJobs {
        /// The rejected job limit.
        max_jobs: u64,
    },

    /// The dispersion was outside of `[0, 1)`.
    #[snafu(display("Job limit dispersion must be within [0, 1), got {}.", dispersion))]
    InvalidDispersion {
        /// The rejected dispersion.
        dispersion: f64,
    },

    /// No strategy was configured.
    #[snafu(display("At least one reboot strategy must be configured."))]
    NoStrategies,

    /// The strategy name matched neither a built-in nor a registered custom strategy.
    #[snafu(display("Unknown reboot strategy '{}'.", name))]
    UnknownStrategy {
        /// The unknown strategy name.
        name: String,
    },

    /// A custom strategy factory failed.
    #[snafu(display("Failed to build custom reboot strategy '{}': {}", name, source))]
    Custom {
        /// The custom strategy name.
        name: String,

        /// The error returned by the factory.
        source: respawn_error::GenericError,
    },

    /// The reboot configuration could not be read.
    #[snafu(display("Failed to read reboot configuration: {}", source))]
    Configuration {
        /// The underlying configuration error.
        source: respawn_config::ConfigurationError,
    },
}

/// Decides, after each completed job, whether the worker process should be replaced.
pub trait RebootStrategy: Send {
    /// Records the outcome of a completed job and returns `true` if the process should reboot.
    ///
    /// Called exactly once per completed job.
    fn should_reboot(&mut self, outcome: &JobOutcome) -> bool;
}

impl<S: RebootStrategy + ?Sized> RebootStrategy for Box<S> {
    fn should_reboot(&mut self, outcome: &JobOutcome) -> bool {
        (**self).should_reboot(outcome)
    }
}
