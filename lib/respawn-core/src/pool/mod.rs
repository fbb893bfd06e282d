//! Worker pools.
//!
//! A worker pool hosts workflow and activity implementations for a single task queue. Tasks reach a pool in one of two
//! ways: polled from the pool's own [`TaskSource`] by [`WorkerPool::start`], or handed over directly through
//! [`WorkerPool::execute`] by a job handler. Either way, every unit runs through the pool's interceptor chain, under the
//! pool's concurrency and rate limits, and a panicking unit is reported as a failed task rather than taking down the
//! process.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use futures::FutureExt as _;
use indexmap::IndexMap;
use respawn_error::{GenericError, JobError};
use serde_json::Value;
use snafu::Snafu;
use tokio::{
    select,
    sync::{oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, warn, Instrument as _};

use crate::job::{CompletedJob, JobId, JobOutcome, OutcomeSender};

mod interceptor;
pub use self::interceptor::{Interceptor, InterceptorCatalog, LoggingInterceptor, MetricsInterceptor, Next};

mod options;
pub use self::options::{PoolConfiguration, PoolsConfiguration, WorkerOptions};

mod rate;
use self::rate::RateLimiter;

mod unit;
pub use self::unit::{
    unit_fn, workflow_factory, ChannelTaskSource, ChannelTaskSources, ExecutionUnit, NoTaskSources, Task, TaskSource,
    TaskSourceFactory, UnitContext, UnitFn, UnitKind, WorkflowFactory,
};

/// Error kind reported for units rejected because their pool is draining.
pub const POOL_DRAINING: &str = "pool_draining";

/// Error kind reported for tasks naming a type the pool does not host.
pub const UNKNOWN_TYPE: &str = "unknown_type";

/// Worker pool error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PoolError {
    /// The pool name was empty.
    #[snafu(display("Worker pool name must not be empty."))]
    EmptyName,

    /// An interceptor name was not found in the catalog.
    #[snafu(display("Unknown interceptor '{}'.", name))]
    UnknownInterceptor {
        /// The unknown interceptor name.
        name: String,
    },

    /// The pool was started more than once.
    #[snafu(display("Worker pool '{}' has already been started.", pool))]
    AlreadyStarted {
        /// The pool name.
        pool: String,
    },

    /// The pool's task source failed.
    #[snafu(display("Worker pool '{}' failed while polling for tasks: {}", pool, source))]
    Transport {
        /// The pool name.
        pool: String,

        /// The error returned by the task source.
        source: GenericError,
    },
}

#[derive(Default)]
struct PoolState {
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time counters of a worker pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Units currently executing.
    pub in_flight: usize,

    /// Units that completed successfully.
    pub completed: u64,

    /// Units that failed, including those that panicked.
    pub failed: u64,
}

struct InFlightGuard(Arc<PoolState>);

impl InFlightGuard {
    fn new(state: Arc<PoolState>) -> Self {
        state.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(state)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A unit resolved for a single task, ready to run.
struct Invocation {
    ctx: UnitContext,
    unit: Arc<dyn ExecutionUnit>,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    state: Arc<PoolState>,
}

impl Invocation {
    async fn run(self, input: Value, permit: Option<OwnedSemaphorePermit>) -> Result<Value, JobError> {
        let _permit = permit;
        let _in_flight = InFlightGuard::new(Arc::clone(&self.state));

        let chain = Next::new(&self.interceptors, &*self.unit).run(&self.ctx, input);
        let result = match AssertUnwindSafe(chain).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                error!(
                    pool = self.ctx.pool(),
                    type_id = self.ctx.type_id(),
                    task_id = %self.ctx.task_id(),
                    "Execution unit panicked."
                );
                Err(JobError::from_panic(payload.as_ref()))
            }
        };

        match &result {
            Ok(_) => self.state.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.state.failed.fetch_add(1, Ordering::Relaxed),
        };

        result
    }
}

/// A set of workflow and activity implementations serving a single task queue.
pub struct WorkerPool {
    name: Arc<str>,
    task_queue: String,
    options: WorkerOptions,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    workflows: IndexMap<String, WorkflowFactory>,
    activities: IndexMap<String, Arc<dyn ExecutionUnit>>,
    workflow_slots: Option<Arc<Semaphore>>,
    activity_slots: Option<Arc<Semaphore>>,
    activity_rate: RateLimiter,
    task_source: Mutex<Option<Box<dyn TaskSource>>>,
    started: AtomicBool,
    stop: CancellationToken,
    state: Arc<PoolState>,
}

impl WorkerPool {
    /// Creates a new `WorkerPool` with the given name and options.
    ///
    /// The pool polls the task queue of the same name until [`with_task_queue`](Self::with_task_queue) says otherwise.
    ///
    /// # Errors
    ///
    /// If the name is empty, an error is returned.
    pub fn new<N: Into<String>>(name: N, options: WorkerOptions) -> Result<Self, PoolError> {
        let name = name.into();
        if name.is_empty() {
            return Err(PoolError::EmptyName);
        }

        let slots = |limit: usize| (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
        let activity_rate = RateLimiter::per_second(options.worker_activities_per_second);
        debug!(
            pool = %name,
            activity_slots = options.max_concurrent_activity_execution_size,
            workflow_slots = options.max_concurrent_workflow_task_execution_size,
            rate_limited = !activity_rate.is_unlimited(),
            "Created worker pool."
        );

        Ok(Self {
            task_queue: name.clone(),
            name: name.into(),
            workflow_slots: slots(options.max_concurrent_workflow_task_execution_size),
            activity_slots: slots(options.max_concurrent_activity_execution_size),
            activity_rate,
            options,
            interceptors: Arc::from(Vec::new()),
            workflows: IndexMap::new(),
            activities: IndexMap::new(),
            task_source: Mutex::new(None),
            started: AtomicBool::new(false),
            stop: CancellationToken::new(),
            state: Arc::new(PoolState::default()),
        })
    }

    /// Creates a new `WorkerPool` from its configuration, resolving interceptors from the given catalog.
    ///
    /// # Errors
    ///
    /// If the name is empty, or an interceptor is not in the catalog, an error is returned.
    pub fn from_configuration(
        name: &str, config: &PoolConfiguration, catalog: &InterceptorCatalog,
    ) -> Result<Self, PoolError> {
        let interceptors = catalog.resolve(&config.interceptors)?;
        Ok(Self::new(name, config.options.clone())?
            .with_task_queue(config.queue.clone())
            .with_interceptors(interceptors))
    }

    /// Sets the task queue this pool polls.
    pub fn with_task_queue<Q: Into<String>>(mut self, task_queue: Q) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    /// Sets the interceptor chain wrapping every unit, outermost first.
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        self.interceptors = Arc::from(interceptors);
        self
    }

    /// Attaches the task source polled by [`start`](Self::start).
    pub fn with_task_source<S: TaskSource + 'static>(mut self, source: S) -> Self {
        self.set_task_source(Box::new(source));
        self
    }

    /// Attaches the task source polled by [`start`](Self::start), replacing any previous one.
    pub fn set_task_source(&mut self, source: Box<dyn TaskSource>) {
        *self.task_source.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    /// Returns the pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the task queue this pool polls.
    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// Returns the execution limits of this pool.
    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Registers a workflow type.
    ///
    /// Returns `false`, leaving the existing registration in place, if the type is already registered.
    pub fn register_workflow_type<T: Into<String>>(&mut self, type_id: T, factory: WorkflowFactory) -> bool {
        let type_id = type_id.into();
        if self.workflows.contains_key(&type_id) {
            debug!(pool = %self.name, type_id = %type_id, "Workflow type already registered. Keeping existing registration.");
            return false;
        }

        debug!(pool = %self.name, type_id = %type_id, "Registered workflow type.");
        self.workflows.insert(type_id, factory);
        true
    }

    /// Registers an activity type.
    ///
    /// Returns `false`, leaving the existing registration in place, if the type is already registered.
    pub fn register_activity_type<T: Into<String>>(&mut self, type_id: T, unit: Arc<dyn ExecutionUnit>) -> bool {
        let type_id = type_id.into();
        if self.activities.contains_key(&type_id) {
            debug!(pool = %self.name, type_id = %type_id, "Activity type already registered. Keeping existing registration.");
            return false;
        }

        debug!(pool = %self.name, type_id = %type_id, "Registered activity type.");
        self.activities.insert(type_id, unit);
        true
    }

    /// Returns `true` if a unit of the given kind and type is registered.
    pub fn has_type(&self, kind: UnitKind, type_id: &str) -> bool {
        match kind {
            UnitKind::Workflow => self.workflows.contains_key(type_id),
            UnitKind::Activity => self.activities.contains_key(type_id),
        }
    }

    /// Returns the registered types of the given kind, in registration order.
    pub fn registered_types(&self, kind: UnitKind) -> Vec<&str> {
        match kind {
            UnitKind::Workflow => self.workflows.keys().map(String::as_str).collect(),
            UnitKind::Activity => self.activities.keys().map(String::as_str).collect(),
        }
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_flight: self.state.in_flight.load(Ordering::Acquire),
            completed: self.state.completed.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
        }
    }

    /// Returns `true` once the pool has begun draining.
    pub fn is_draining(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Begins draining the pool.
    ///
    /// The pool stops polling for tasks and rejects new units, while units already executing run to completion.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            info!(pool = %self.name, "Worker pool draining.");
        }
        self.stop.cancel();
    }

    fn draining_error(&self) -> JobError {
        JobError::msg(POOL_DRAINING, format!("Worker pool '{}' is draining.", self.name))
    }

    fn prepare(&self, task_id: JobId, kind: UnitKind, type_id: &str) -> Result<Invocation, JobError> {
        if self.is_draining() {
            return Err(self.draining_error());
        }

        let unit = match kind {
            UnitKind::Workflow => self
                .workflows
                .get(type_id)
                .map(|factory| Arc::<dyn ExecutionUnit>::from((**factory)())),
            UnitKind::Activity => self.activities.get(type_id).cloned(),
        }
        .ok_or_else(|| {
            JobError::msg(
                UNKNOWN_TYPE,
                format!(
                    "No {} of type '{}' is registered in worker pool '{}'.",
                    kind, type_id, self.name
                ),
            )
        })?;

        Ok(Invocation {
            ctx: UnitContext::new(Arc::clone(&self.name), kind, type_id, task_id),
            unit,
            interceptors: Arc::clone(&self.interceptors),
            state: Arc::clone(&self.state),
        })
    }

    async fn acquire_slot(&self, kind: UnitKind) -> Option<OwnedSemaphorePermit> {
        let slots = match kind {
            UnitKind::Workflow => &self.workflow_slots,
            UnitKind::Activity => &self.activity_slots,
        };

        // The semaphores are never closed, so a failed acquire cannot happen.
        let permit = match slots {
            Some(slots) => Arc::clone(slots).acquire_owned().await.ok(),
            None => None,
        };

        if kind == UnitKind::Activity {
            self.activity_rate.acquire().await;
        }

        permit
    }

    /// Executes a single unit directly, bypassing the task source.
    ///
    /// Waits for a free slot if the pool is at its concurrency limit.
    ///
    /// # Errors
    ///
    /// If the pool is draining, the type is not registered, or the unit itself fails, an error is returned. A unit that
    /// panics is reported as an error of kind `panic`.
    pub async fn execute(&self, task_id: JobId, kind: UnitKind, type_id: &str, input: Value) -> Result<Value, JobError> {
        let invocation = self.prepare(task_id, kind, type_id)?;

        let permit = select! {
            permit = self.acquire_slot(kind) => permit,
            _ = self.stop.cancelled() => return Err(self.draining_error()),
        };

        invocation.run(input, permit).await
    }

    /// Polls the pool's task source and executes tasks until the pool is stopped or the source closes.
    ///
    /// The outcome of every executed task is sent to `outcomes`. Once polling ends, units still executing are awaited,
    /// subject to the pool's stop timeout. A pool without a task source returns immediately.
    ///
    /// # Errors
    ///
    /// If the pool was already started, or the task source fails, an error is returned. A task source failure stops the
    /// pool, and is only returned after in-flight units have drained.
    pub async fn start(&self, outcomes: OutcomeSender) -> Result<(), PoolError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PoolError::AlreadyStarted {
                pool: self.name.to_string(),
            });
        }

        let source = self.task_source.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut source) = source else {
            debug!(pool = %self.name, "Worker pool has no task source. Serving dispatched units only.");
            return Ok(());
        };

        info!(pool = %self.name, task_queue = %self.task_queue, "Worker pool polling for tasks.");

        let mut units = JoinSet::new();
        let mut fault = None;

        loop {
            select! {
                _ = self.stop.cancelled() => break,

                Some(result) = units.join_next(), if !units.is_empty() => {
                    if let Err(e) = result {
                        error!(pool = %self.name, error = %e, "Unit task failed unexpectedly.");
                    }
                },

                next = source.next_task() => match next {
                    Ok(Some(task)) => {
                        let Task { id, kind, type_id, input, reply } = task;

                        let invocation = match self.prepare(id.clone(), kind, &type_id) {
                            Ok(invocation) => invocation,
                            Err(e) => {
                                report(id, Err(e), reply, &outcomes);
                                continue;
                            }
                        };

                        // Slots are acquired here, in the polling sequence, so that tasks start in the order they were
                        // received.
                        let permit = select! {
                            permit = self.acquire_slot(kind) => permit,
                            _ = self.stop.cancelled() => {
                                report(id, Err(self.draining_error()), reply, &outcomes);
                                break;
                            }
                        };

                        let span = debug_span!("unit", pool = %self.name, kind = %kind, type_id = %type_id, task_id = %id);
                        let outcomes = outcomes.clone();
                        units.spawn(
                            async move {
                                let result = invocation.run(input, permit).await;
                                report(id, result, reply, &outcomes);
                            }
                            .instrument(span),
                        );
                    }
                    Ok(None) => {
                        info!(pool = %self.name, "Task source closed.");
                        break;
                    }
                    Err(e) => {
                        error!(pool = %self.name, error = %e, "Task source failed. Stopping worker pool.");
                        self.stop.cancel();
                        fault = Some(e);
                        break;
                    }
                },
            }
        }

        // Polling has ended, but units already executing are allowed to finish.
        drop(source);
        let remaining = units.len();
        if remaining > 0 {
            debug!(pool = %self.name, remaining, "Waiting for in-flight units to complete.");
        }

        let drain = async {
            while let Some(result) = units.join_next().await {
                if let Err(e) = result {
                    error!(pool = %self.name, error = %e, "Unit task failed unexpectedly.");
                }
            }
        };

        match self.options.stop_timeout() {
            Some(stop_timeout) => {
                if timeout(stop_timeout, drain).await.is_err() {
                    warn!(
                        pool = %self.name,
                        abandoned = units.len(),
                        "Timed out waiting for in-flight units. Abandoning them."
                    );
                    units.shutdown().await;
                }
            }
            None => drain.await,
        }

        info!(pool = %self.name, "Worker pool stopped.");

        match fault {
            Some(source) => Err(PoolError::Transport {
                pool: self.name.to_string(),
                source,
            }),
            None => Ok(()),
        }
    }
}

type Reply = oneshot::Sender<Result<Value, JobError>>;

fn report(id: JobId, result: Result<Value, JobError>, reply: Option<Reply>, outcomes: &OutcomeSender) {
    let outcome = JobOutcome::from_result(&result);

    if let Some(reply) = reply {
        // The submitter may have stopped waiting, which does not change the outcome.
        let _ = reply.send(result);
    }

    // The supervisor only goes away once every pool has stopped.
    let _ = outcomes.send(CompletedJob::new(id, outcome));
}
