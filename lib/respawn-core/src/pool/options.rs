use std::time::Duration;

use indexmap::IndexMap;
use respawn_config::{ConfigurationError, GenericConfiguration};
use serde::Deserialize;

const DEFAULT_POOL_NAME: &str = "default";
const DEFAULT_TASK_QUEUE: &str = "default";

const fn default_activity_concurrency() -> usize {
    1
}

fn default_task_queue() -> String {
    DEFAULT_TASK_QUEUE.to_string()
}

/// Per-pool execution limits.
///
/// A limit of zero means unlimited.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerOptions {
    /// Maximum number of activity units executing at once.
    pub max_concurrent_activity_execution_size: usize,

    /// Maximum number of workflow units executing at once.
    pub max_concurrent_workflow_task_execution_size: usize,

    /// Maximum number of activity units started per second.
    pub worker_activities_per_second: f64,

    /// How long a draining pool waits for in-flight units before abandoning them. Unset waits indefinitely.
    pub worker_stop_timeout_secs: Option<u64>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activity_execution_size: default_activity_concurrency(),
            max_concurrent_workflow_task_execution_size: 0,
            worker_activities_per_second: 0.0,
            worker_stop_timeout_secs: None,
        }
    }
}

impl WorkerOptions {
    /// Returns the stop timeout as a duration, if one is set.
    pub fn stop_timeout(&self) -> Option<Duration> {
        self.worker_stop_timeout_secs.map(Duration::from_secs)
    }
}

/// Configuration of a single worker pool.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PoolConfiguration {
    /// Task queue the pool polls.
    #[serde(default = "default_task_queue")]
    pub queue: String,

    /// Names of the interceptors wrapping every unit, outermost first.
    #[serde(default)]
    pub interceptors: Vec<String>,

    /// Execution limits.
    #[serde(default)]
    pub options: WorkerOptions,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            queue: default_task_queue(),
            interceptors: Vec::new(),
            options: WorkerOptions::default(),
        }
    }
}

/// Configuration of every worker pool, keyed by pool name.
///
/// Pools are sorted by name when loaded, whatever order the configuration source lists them in. This is also the order in
/// which they are searched when routing a task by type.
///
/// Read from the `workers` section:
///
/// ```yaml
/// workers:
///   billing:
///     queue: billing
///     interceptors: [logging, metrics]
///     options:
///       max_concurrent_activity_execution_size: 8
/// ```
///
/// When the section is absent, a single pool named `default` polling the `default` queue is configured.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolsConfiguration {
    pools: IndexMap<String, PoolConfiguration>,
}

impl Default for PoolsConfiguration {
    fn default() -> Self {
        let mut pools = IndexMap::new();
        pools.insert(DEFAULT_POOL_NAME.to_string(), PoolConfiguration::default());
        Self { pools }
    }
}

impl PoolsConfiguration {
    /// Creates a new `PoolsConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the `workers` section is present but malformed, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        match config.try_get_typed::<IndexMap<String, PoolConfiguration>>("workers")? {
            Some(pools) if !pools.is_empty() => Ok(Self::sorted(pools)),
            _ => Ok(Self::default()),
        }
    }

    fn sorted(mut pools: IndexMap<String, PoolConfiguration>) -> Self {
        pools.sort_keys();
        Self { pools }
    }

    /// Returns the configured pools, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PoolConfiguration)> {
        self.pools.iter().map(|(name, pool)| (name.as_str(), pool))
    }

    /// Returns the number of configured pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns `true` if no pools are configured.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
