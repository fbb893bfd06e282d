use std::sync::Arc;

use indexmap::IndexMap;
use respawn_config::GenericConfiguration;
use respawn_error::{ErrorKind, GenericError};
use serde::Deserialize;
use snafu::ResultExt as _;
use tracing::debug;

use super::{Always, Chain, Configuration, MaxJobs, OnException, RebootStrategy, StrategyError};

const DEFAULT_STRATEGY: &str = "on_exception";
const DEFAULT_MAX_JOBS: u64 = 1000;
const DEFAULT_MAX_JOBS_DISPERSION: f64 = 0.2;

/// Builds a custom reboot strategy from the reboot configuration.
pub type StrategyFactory =
    Arc<dyn Fn(&RebootConfiguration) -> Result<Box<dyn RebootStrategy>, GenericError> + Send + Sync>;

/// Named reboot strategies supplied by the embedding application.
///
/// Built-in strategy names (`always`, `on_exception`, `max_jobs`) always take precedence over custom ones.
#[derive(Clone, Default)]
pub struct CustomStrategies {
    factories: IndexMap<String, StrategyFactory>,
}

impl CustomStrategies {
    /// Registers a custom strategy under the given name, replacing any previous registration.
    pub fn register<N, F>(&mut self, name: N, factory: F)
    where
        N: Into<String>,
        F: Fn(&RebootConfiguration) -> Result<Box<dyn RebootStrategy>, GenericError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    fn get(&self, name: &str) -> Option<&StrategyFactory> {
        self.factories.get(name)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(name) => vec![name],
            OneOrMany::Many(names) => names,
        }
    }
}

/// Reboot strategy configuration.
///
/// Read from the `kernel_reboot` section:
///
/// ```yaml
/// kernel_reboot:
///   strategy: [on_exception, max_jobs]
///   allowed_exceptions: [validation]
///   max_jobs: 1000
///   max_jobs_dispersion: 0.2
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RebootConfiguration {
    /// Names of the strategies to combine. More than one builds a [`Chain`].
    pub strategy: Vec<String>,

    /// Failure kinds tolerated by the `on_exception` strategy.
    pub allowed_exceptions: Vec<ErrorKind>,

    /// Job limit for the `max_jobs` strategy.
    pub max_jobs: u64,

    /// Relative jitter applied to `max_jobs`.
    pub max_jobs_dispersion: f64,
}

impl Default for RebootConfiguration {
    fn default() -> Self {
        Self {
            strategy: vec![DEFAULT_STRATEGY.to_string()],
            allowed_exceptions: Vec::new(),
            max_jobs: DEFAULT_MAX_JOBS,
            max_jobs_dispersion: DEFAULT_MAX_JOBS_DISPERSION,
        }
    }
}

impl RebootConfiguration {
    /// Creates a new `RebootConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If a value is present but has the wrong type, or the job limit parameters are out of range, an error is
    /// returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, StrategyError> {
        let defaults = Self::default();

        let strategy = config
            .try_get_typed::<OneOrMany>("kernel_reboot.strategy")
            .context(Configuration)?
            .map(Vec::from)
            .unwrap_or(defaults.strategy);
        let allowed_exceptions = config
            .try_get_typed("kernel_reboot.allowed_exceptions")
            .context(Configuration)?
            .unwrap_or(defaults.allowed_exceptions);
        let max_jobs = config
            .try_get_typed("kernel_reboot.max_jobs")
            .context(Configuration)?
            .unwrap_or(defaults.max_jobs);
        let max_jobs_dispersion = config
            .try_get_typed("kernel_reboot.max_jobs_dispersion")
            .context(Configuration)?
            .unwrap_or(defaults.max_jobs_dispersion);

        let reboot_config = Self {
            strategy,
            allowed_exceptions,
            max_jobs,
            max_jobs_dispersion,
        };
        reboot_config.validate()?;

        Ok(reboot_config)
    }

    /// Validates the configuration without building any strategy.
    ///
    /// # Errors
    ///
    /// If no strategy is named, or the job limit parameters are out of range, an error is returned.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.strategy.is_empty() {
            return Err(StrategyError::NoStrategies);
        }
        if self.max_jobs == 0 {
            return Err(StrategyError::InvalidMaxJobs {
                max_jobs: self.max_jobs,
            });
        }
        if !(0.0..1.0).contains(&self.max_jobs_dispersion) {
            return Err(StrategyError::InvalidDispersion {
                dispersion: self.max_jobs_dispersion,
            });
        }
        Ok(())
    }

    /// Builds the configured reboot strategy.
    ///
    /// A single name builds that strategy directly, while multiple names build a [`Chain`] in the order given.
    ///
    /// # Errors
    ///
    /// If a name matches neither a built-in nor a custom strategy, or a strategy rejects its parameters, an error is
    /// returned.
    pub fn build(&self, custom: &CustomStrategies) -> Result<Box<dyn RebootStrategy>, StrategyError> {
        self.validate()?;

        let mut strategies = self
            .strategy
            .iter()
            .map(|name| self.build_one(name, custom))
            .collect::<Result<Vec<_>, _>>()?;

        if strategies.len() == 1 {
            if let Some(strategy) = strategies.pop() {
                return Ok(strategy);
            }
        }

        Ok(Box::new(Chain::new(strategies)))
    }

    fn build_one(&self, name: &str, custom: &CustomStrategies) -> Result<Box<dyn RebootStrategy>, StrategyError> {
        debug!(strategy = name, "Building reboot strategy.");

        match name {
            "always" => Ok(Box::new(Always)),
            "on_exception" => Ok(Box::new(OnException::new(self.allowed_exceptions.iter().cloned()))),
            "max_jobs" => Ok(Box::new(MaxJobs::new(self.max_jobs, self.max_jobs_dispersion)?)),
            other => match custom.get(other) {
                Some(factory) => factory(self).map_err(|source| StrategyError::Custom {
                    name: other.to_string(),
                    source,
                }),
                None => Err(StrategyError::UnknownStrategy { name: other.to_string() }),
            },
        }
    }
}
