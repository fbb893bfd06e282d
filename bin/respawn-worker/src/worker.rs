//! Assembles a worker process from configuration.

use std::{path::Path, sync::Arc};

use respawn_config::{ConfigurationLoader, GenericConfiguration};
use respawn_core::{
    pool::{InterceptorCatalog, NoTaskSources, PoolsConfiguration},
    reboot::{CustomStrategies, RebootConfiguration},
    registry::{AssignmentTable, PoolDispatcher, WorkerRegistry},
    runtime::{ProcessSupervisor, SupervisorConfiguration},
};
use respawn_error::{ErrorContext as _, GenericError};
use tracing::info;

use crate::builtin;

/// Prefix of environment variables overriding the configuration file.
const ENV_PREFIX: &str = "RESPAWN";

/// Mode served by the pool dispatcher.
const QUEUE_MODE: &str = "queue";

/// Loads the configuration file, with `RESPAWN_`-prefixed environment variables layered on top.
///
/// Files ending in `.json` are read as JSON. Anything else is read as YAML.
pub fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let loader = ConfigurationLoader::default();
    let is_json = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    let loader = if is_json {
        loader.from_json(path)
    } else {
        loader.from_yaml(path)
    };

    let config = loader
        .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?
        .from_environment(ENV_PREFIX)
        .error_context("Failed to load configuration from environment.")?
        .into_generic();
    Ok(config)
}

/// Builds a supervisor, with its strategy, pools and handlers, from the given configuration.
///
/// Everything that can be rejected up front is: unknown strategies, out-of-range job limits, unknown interceptors,
/// assignments to missing pools, and a configured mode without a handler.
pub fn build_supervisor(config: &GenericConfiguration) -> Result<ProcessSupervisor, GenericError> {
    let reboot_config =
        RebootConfiguration::from_configuration(config).error_context("Invalid reboot strategy configuration.")?;
    let strategy = reboot_config
        .build(&CustomStrategies::default())
        .error_context("Failed to build reboot strategy.")?;

    let supervisor_config =
        SupervisorConfiguration::from_configuration(config).error_context("Invalid supervisor configuration.")?;
    let pools = PoolsConfiguration::from_configuration(config).error_context("Invalid worker pool configuration.")?;
    let assignments =
        AssignmentTable::from_configuration(config).error_context("Invalid unit assignment configuration.")?;

    // Tasks reach pools only through the queue dispatcher: the process has no queue transport of its own.
    let mut registry = WorkerRegistry::from_configuration(&pools, &InterceptorCatalog::default(), &NoTaskSources)
        .error_context("Failed to build worker pools.")?;
    registry
        .register_mode(QUEUE_MODE, PoolDispatcher)
        .error_context("Failed to register job handlers.")?;
    builtin::register(&mut registry, &assignments).error_context("Failed to register built-in units.")?;

    registry
        .resolve(supervisor_config.mode())
        .error_context("Configured supervisor mode cannot be served.")?;

    info!(
        strategy = ?reboot_config.strategy,
        mode = supervisor_config.mode(),
        pools = pools.len(),
        "Worker assembled."
    );

    Ok(ProcessSupervisor::new(Arc::new(registry), strategy, supervisor_config))
}
