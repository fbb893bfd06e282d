//! Worker registry.
//!
//! The registry owns every worker pool in the process and the handlers bound to each job mode. It is assembled at
//! startup, then frozen behind an `Arc` and shared with the supervisor and every job handler.

use std::sync::Arc;

use indexmap::IndexMap;
use respawn_error::GenericError;
use snafu::Snafu;
use tracing::{debug, warn};

use crate::{
    job::JobHandler,
    pool::{
        ExecutionUnit, InterceptorCatalog, PoolError, PoolsConfiguration, TaskSourceFactory, UnitKind, WorkerPool,
        WorkflowFactory,
    },
};

mod assignments;
pub use self::assignments::AssignmentTable;

mod dispatch;
pub use self::dispatch::{PoolDispatcher, INVALID_PAYLOAD, UNKNOWN_POOL};

/// Error kind reported for jobs whose mode has no registered handler.
pub const UNKNOWN_MODE: &str = "unknown_mode";

/// Registry error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// A pool with the same name was already added.
    #[snafu(display("Worker pool '{}' is already registered.", pool))]
    DuplicatePool {
        /// The pool name.
        pool: String,
    },

    /// A handler for the same mode was already registered.
    #[snafu(display("A handler for mode '{}' is already registered.", mode))]
    DuplicateMode {
        /// The job mode.
        mode: String,
    },

    /// No handler is registered for the mode.
    #[snafu(display("No handler is registered for mode '{}'.", mode))]
    UnknownMode {
        /// The job mode.
        mode: String,
    },

    /// A unit was assigned to a pool that does not exist.
    #[snafu(display("Type '{}' is assigned to unknown worker pool '{}'.", type_id, pool))]
    UnknownPool {
        /// The pool name.
        pool: String,

        /// The type being registered.
        type_id: String,
    },

    /// A pool could not be built.
    #[snafu(display("Failed to build worker pool '{}': {}", pool, source))]
    Pool {
        /// The pool name.
        pool: String,

        /// The underlying pool error.
        source: PoolError,
    },

    /// The task source of a pool could not be created.
    #[snafu(display("Failed to create task source for worker pool '{}' (queue '{}'): {}", pool, task_queue, source))]
    CreateTaskSource {
        /// The pool name.
        pool: String,

        /// The task queue the pool polls.
        task_queue: String,

        /// The error returned by the task source factory.
        source: GenericError,
    },
}

/// Which pools a unit type is registered in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    /// Only the named pool.
    Named(String),

    /// Every pool in the registry.
    AllPools,
}

impl From<Option<String>> for Assignment {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(pool) => Self::Named(pool),
            None => Self::AllPools,
        }
    }
}

impl From<&str> for Assignment {
    fn from(value: &str) -> Self {
        Self::Named(value.to_string())
    }
}

/// Worker pools and job handlers of the process.
#[derive(Default)]
pub struct WorkerRegistry {
    pools: IndexMap<String, WorkerPool>,
    modes: IndexMap<String, Arc<dyn JobHandler>>,
}

impl WorkerRegistry {
    /// Creates an empty `WorkerRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a `WorkerRegistry` holding one pool per configured pool.
    ///
    /// Each pool polls the task source that `task_sources` creates for the pool's task queue.
    ///
    /// # Errors
    ///
    /// If a pool cannot be built, such as when it names an unknown interceptor, or its task source cannot be created, an
    /// error is returned.
    pub fn from_configuration<F>(
        pools: &PoolsConfiguration, catalog: &InterceptorCatalog, task_sources: &F,
    ) -> Result<Self, RegistryError>
    where
        F: TaskSourceFactory + ?Sized,
    {
        let mut registry = Self::new();
        for (name, config) in pools.iter() {
            let mut pool = WorkerPool::from_configuration(name, config, catalog).map_err(|source| RegistryError::Pool {
                pool: name.to_string(),
                source,
            })?;

            let task_source = task_sources
                .create(pool.task_queue())
                .map_err(|source| RegistryError::CreateTaskSource {
                    pool: name.to_string(),
                    task_queue: pool.task_queue().to_string(),
                    source,
                })?;
            if let Some(task_source) = task_source {
                pool.set_task_source(task_source);
            }

            registry.add_pool(pool)?;
        }
        Ok(registry)
    }

    /// Adds a worker pool.
    ///
    /// # Errors
    ///
    /// If a pool with the same name already exists, an error is returned.
    pub fn add_pool(&mut self, pool: WorkerPool) -> Result<(), RegistryError> {
        if self.pools.contains_key(pool.name()) {
            return Err(RegistryError::DuplicatePool {
                pool: pool.name().to_string(),
            });
        }

        debug!(pool = pool.name(), task_queue = pool.task_queue(), "Added worker pool.");
        self.pools.insert(pool.name().to_string(), pool);
        Ok(())
    }

    /// Binds a handler to a job mode.
    ///
    /// # Errors
    ///
    /// If a handler is already bound to the mode, an error is returned.
    pub fn register_mode<M, H>(&mut self, mode: M, handler: H) -> Result<(), RegistryError>
    where
        M: Into<String>,
        H: JobHandler + 'static,
    {
        let mode = mode.into();
        if self.modes.contains_key(&mode) {
            return Err(RegistryError::DuplicateMode { mode });
        }

        debug!(mode = %mode, "Registered job handler.");
        self.modes.insert(mode, Arc::new(handler));
        Ok(())
    }

    /// Returns the handler bound to a job mode.
    ///
    /// # Errors
    ///
    /// If no handler is bound to the mode, an error is returned.
    pub fn resolve(&self, mode: &str) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.modes
            .get(mode)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownMode { mode: mode.to_string() })
    }

    fn targets(&self, type_id: &str, assignment: &Assignment) -> Result<Vec<String>, RegistryError> {
        match assignment {
            Assignment::Named(pool) if self.pools.contains_key(pool) => Ok(vec![pool.clone()]),
            Assignment::Named(pool) => Err(RegistryError::UnknownPool {
                pool: pool.clone(),
                type_id: type_id.to_string(),
            }),
            Assignment::AllPools => {
                if self.pools.is_empty() {
                    warn!(type_id, "No worker pools exist. Type will not be served.");
                }
                Ok(self.pools.keys().cloned().collect())
            }
        }
    }

    /// Registers a workflow type in the pools selected by `assignment`.
    ///
    /// Pools that already host the type keep their existing registration.
    ///
    /// # Errors
    ///
    /// If the assignment names a pool that does not exist, an error is returned and no pool is modified.
    pub fn register_workflow_type(
        &mut self, type_id: &str, factory: WorkflowFactory, assignment: &Assignment,
    ) -> Result<(), RegistryError> {
        for target in self.targets(type_id, assignment)? {
            if let Some(pool) = self.pools.get_mut(&target) {
                pool.register_workflow_type(type_id, Arc::clone(&factory));
            }
        }
        Ok(())
    }

    /// Registers an activity type in the pools selected by `assignment`.
    ///
    /// Pools that already host the type keep their existing registration.
    ///
    /// # Errors
    ///
    /// If the assignment names a pool that does not exist, an error is returned and no pool is modified.
    pub fn register_activity_type(
        &mut self, type_id: &str, unit: Arc<dyn ExecutionUnit>, assignment: &Assignment,
    ) -> Result<(), RegistryError> {
        for target in self.targets(type_id, assignment)? {
            if let Some(pool) = self.pools.get_mut(&target) {
                pool.register_activity_type(type_id, Arc::clone(&unit));
            }
        }
        Ok(())
    }

    /// Returns the pool with the given name.
    pub fn pool(&self, name: &str) -> Option<&WorkerPool> {
        self.pools.get(name)
    }

    /// Returns every pool, in the order they were added.
    pub fn pools(&self) -> impl Iterator<Item = &WorkerPool> {
        self.pools.values()
    }

    /// Returns the first pool, in the order they were added, that hosts the given unit type.
    pub fn find_pool(&self, kind: UnitKind, type_id: &str) -> Option<&WorkerPool> {
        self.pools.values().find(|pool| pool.has_type(kind, type_id))
    }

    /// Begins draining every pool.
    pub fn stop_pools(&self) {
        for pool in self.pools.values() {
            pool.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use respawn_error::JobError;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        job::Job,
        job::JobOutcome,
        pool::{unit_fn, workflow_factory, ChannelTaskSources, NoTaskSources, Task, WorkerOptions},
    };

    struct Constant(Value);

    #[async_trait]
    impl JobHandler for Constant {
        async fn handle(&self, _job: Job, _registry: &WorkerRegistry) -> Result<Value, JobError> {
            Ok(self.0.clone())
        }
    }

    fn registry_with(pools: &[&str]) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for name in pools {
            registry
                .add_pool(WorkerPool::new(*name, WorkerOptions::default()).unwrap())
                .unwrap();
        }
        registry
    }

    fn echo() -> Arc<dyn ExecutionUnit> {
        Arc::new(unit_fn(|input| async move { Ok::<_, JobError>(input) }))
    }

    #[test]
    fn duplicate_pool_is_rejected() {
        let mut registry = registry_with(&["billing"]);
        let err = registry
            .add_pool(WorkerPool::new("billing", WorkerOptions::default()).unwrap())
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicatePool { pool } if pool == "billing"));
    }

    #[tokio::test]
    async fn modes_resolve_to_their_handlers() {
        let mut registry = WorkerRegistry::new();
        registry.register_mode("queue", Constant(json!("queue"))).unwrap();
        registry.register_mode("grpc", Constant(json!("grpc"))).unwrap();

        let handler = registry.resolve("grpc").unwrap();
        let result = handler.handle(Job::new("1", "grpc", Value::Null), &registry).await.unwrap();
        assert_eq!(result, json!("grpc"));

        assert!(matches!(
            registry.resolve("http"),
            Err(RegistryError::UnknownMode { mode }) if mode == "http"
        ));
        assert!(matches!(
            registry.register_mode("queue", Constant(Value::Null)),
            Err(RegistryError::DuplicateMode { .. })
        ));
    }

    #[test]
    fn named_assignment_targets_one_pool() {
        let mut registry = registry_with(&["default", "billing"]);
        registry
            .register_activity_type("ChargeCard", echo(), &Assignment::from("billing"))
            .unwrap();

        assert!(registry.pool("billing").unwrap().has_type(UnitKind::Activity, "ChargeCard"));
        assert!(!registry.pool("default").unwrap().has_type(UnitKind::Activity, "ChargeCard"));
    }

    #[test]
    fn all_pools_assignment_targets_every_pool() {
        let mut registry = registry_with(&["default", "billing"]);
        registry
            .register_activity_type("SendEmail", echo(), &Assignment::AllPools)
            .unwrap();

        assert!(registry.pools().all(|pool| pool.has_type(UnitKind::Activity, "SendEmail")));
    }

    #[test]
    fn workflow_types_follow_assignments() {
        let mut registry = registry_with(&["default", "billing"]);
        let factory = workflow_factory(|| unit_fn(|input| async move { Ok::<_, JobError>(input) }));
        registry
            .register_workflow_type("Onboarding", Arc::clone(&factory), &Assignment::AllPools)
            .unwrap();
        registry
            .register_workflow_type("Invoice", Arc::clone(&factory), &Assignment::from("billing"))
            .unwrap();

        assert!(registry.pools().all(|pool| pool.has_type(UnitKind::Workflow, "Onboarding")));
        assert!(registry.pool("billing").unwrap().has_type(UnitKind::Workflow, "Invoice"));
        assert!(!registry.pool("default").unwrap().has_type(UnitKind::Workflow, "Invoice"));
        // Workflow and activity namespaces are separate.
        assert!(!registry.pool("billing").unwrap().has_type(UnitKind::Activity, "Invoice"));

        let err = registry
            .register_workflow_type("Refund", factory, &Assignment::from("payments"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPool { pool, .. } if pool == "payments"));
        assert!(registry.pools().all(|pool| !pool.has_type(UnitKind::Workflow, "Refund")));
    }

    #[test]
    fn unknown_pool_assignment_is_rejected() {
        let mut registry = registry_with(&["default"]);
        let err = registry
            .register_activity_type("ChargeCard", echo(), &Assignment::from("billing"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownPool { pool, .. } if pool == "billing"));
        assert!(!registry.pool("default").unwrap().has_type(UnitKind::Activity, "ChargeCard"));
    }

    #[test]
    fn find_pool_prefers_first_added() {
        let mut registry = registry_with(&["first", "second"]);
        registry
            .register_activity_type("Echo", echo(), &Assignment::AllPools)
            .unwrap();
        assert_eq!(registry.find_pool(UnitKind::Activity, "Echo").unwrap().name(), "first");
        assert!(registry.find_pool(UnitKind::Workflow, "Echo").is_none());
    }

    #[test]
    fn pools_from_configuration_reject_unknown_interceptors() {
        let config = respawn_config::ConfigurationLoader::default()
            .from_yaml_str("workers:\n  default:\n    interceptors: [auditing]\n")
            .unwrap()
            .into_generic();
        let pools = PoolsConfiguration::from_configuration(&config).unwrap();

        let err = WorkerRegistry::from_configuration(&pools, &InterceptorCatalog::default(), &NoTaskSources)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RegistryError::Pool {
                source: PoolError::UnknownInterceptor { .. },
                ..
            }
        ));
    }

    fn two_queue_config() -> PoolsConfiguration {
        let config = respawn_config::ConfigurationLoader::default()
            .from_yaml_str(
                r#"
workers:
  billing:
    queue: billing-tasks
  default: {}
"#,
            )
            .unwrap()
            .into_generic();
        PoolsConfiguration::from_configuration(&config).unwrap()
    }

    #[tokio::test]
    async fn configured_pools_poll_their_task_queue() {
        let task_sources = ChannelTaskSources::new(8);
        let mut registry =
            WorkerRegistry::from_configuration(&two_queue_config(), &InterceptorCatalog::default(), &task_sources)
                .unwrap();
        registry
            .register_activity_type("Echo", echo(), &Assignment::AllPools)
            .unwrap();
        let registry = Arc::new(registry);

        // Queues are bound by name, not by pool.
        assert!(task_sources.sender("billing").is_none());
        let billing = task_sources.sender("billing-tasks").unwrap();
        assert!(task_sources.sender("default").is_some());

        let (outcomes_tx, mut outcomes_rx) = tokio::sync::mpsc::unbounded_channel();
        let polling = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.pool("billing").unwrap().start(outcomes_tx).await })
        };

        let (task, reply) = Task::new("t-1", UnitKind::Activity, "Echo", json!("hi")).with_reply();
        billing.send(task).await.unwrap();
        assert_eq!(reply.await.unwrap().unwrap(), json!("hi"));

        let completed = outcomes_rx.recv().await.unwrap();
        assert_eq!(completed.id().as_str(), "t-1");
        assert_eq!(completed.outcome(), &JobOutcome::Success);

        registry.stop_pools();
        polling.await.unwrap().unwrap();
        assert_eq!(registry.pool("billing").unwrap().stats().completed, 1);
        assert_eq!(registry.pool("default").unwrap().stats().completed, 0);
    }

    #[test]
    fn task_source_failures_name_the_pool() {
        let failing = |task_queue: &str| -> Result<Option<Box<dyn crate::pool::TaskSource>>, GenericError> {
            Err(respawn_error::generic_error!("queue '{}' is unreachable", task_queue))
        };

        let err = WorkerRegistry::from_configuration(&two_queue_config(), &InterceptorCatalog::default(), &failing)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RegistryError::CreateTaskSource { pool, task_queue, .. } if pool == "billing" && task_queue == "billing-tasks"
        ));
    }

    #[test]
    fn a_task_queue_is_polled_by_one_pool() {
        let config = respawn_config::ConfigurationLoader::default()
            .from_yaml_str("workers:\n  first:\n    queue: shared\n  second:\n    queue: shared\n")
            .unwrap()
            .into_generic();
        let pools = PoolsConfiguration::from_configuration(&config).unwrap();

        let err = WorkerRegistry::from_configuration(&pools, &InterceptorCatalog::default(), &ChannelTaskSources::new(1))
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::CreateTaskSource { pool, .. } if pool == "second"));
    }
}
