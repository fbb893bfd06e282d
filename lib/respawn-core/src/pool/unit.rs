use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use indexmap::IndexMap;
use respawn_error::{generic_error, GenericError, JobError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::job::JobId;

/// The two kinds of execution unit a worker pool can host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// A workflow: a fresh instance is created for every task.
    Workflow,

    /// An activity: a single shared instance serves every task.
    Activity,
}

impl UnitKind {
    /// Returns the kind as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Activity => "activity",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes the execution unit invocation currently in progress.
#[derive(Clone, Debug)]
pub struct UnitContext {
    pool: Arc<str>,
    kind: UnitKind,
    type_id: Arc<str>,
    task_id: JobId,
}

impl UnitContext {
    pub(crate) fn new(pool: Arc<str>, kind: UnitKind, type_id: &str, task_id: JobId) -> Self {
        Self {
            pool,
            kind,
            type_id: type_id.into(),
            task_id,
        }
    }

    /// Returns the name of the pool executing the unit.
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Returns the kind of the unit.
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Returns the registered type identifier of the unit.
    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    /// Returns the identifier of the task being executed.
    pub fn task_id(&self) -> &JobId {
        &self.task_id
    }
}

/// A workflow or activity implementation.
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    /// Executes the unit against the given input.
    ///
    /// # Errors
    ///
    /// If the unit fails, an error describing the failure is returned.
    async fn execute(&self, ctx: &UnitContext, input: Value) -> Result<Value, JobError>;
}

/// Creates a fresh workflow instance for every task.
pub type WorkflowFactory = Arc<dyn Fn() -> Box<dyn ExecutionUnit> + Send + Sync>;

/// Creates a [`WorkflowFactory`] from a constructor function.
pub fn workflow_factory<U, F>(constructor: F) -> WorkflowFactory
where
    U: ExecutionUnit + 'static,
    F: Fn() -> U + Send + Sync + 'static,
{
    Arc::new(move || Box::new(constructor()) as Box<dyn ExecutionUnit>)
}

/// An execution unit backed by an async function.
pub struct UnitFn<F>(F);

/// Creates an execution unit from an async function of its input.
pub fn unit_fn<F, Fut>(f: F) -> UnitFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    UnitFn(f)
}

#[async_trait]
impl<F, Fut> ExecutionUnit for UnitFn<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn execute(&self, _ctx: &UnitContext, input: Value) -> Result<Value, JobError> {
        (self.0)(input).await
    }
}

/// A task handed to a worker pool by its task source.
pub struct Task {
    pub(crate) id: JobId,
    pub(crate) kind: UnitKind,
    pub(crate) type_id: String,
    pub(crate) input: Value,
    pub(crate) reply: Option<oneshot::Sender<Result<Value, JobError>>>,
}

impl Task {
    /// Creates a new `Task`.
    pub fn new<I, T>(id: I, kind: UnitKind, type_id: T, input: Value) -> Self
    where
        I: Into<JobId>,
        T: Into<String>,
    {
        Self {
            id: id.into(),
            kind,
            type_id: type_id.into(),
            input,
            reply: None,
        }
    }

    /// Attaches a reply channel, returning the receiving half.
    ///
    /// The result of the task is delivered on the channel once the unit completes.
    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<Result<Value, JobError>>) {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        (self, rx)
    }

    /// Returns the task identifier.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the kind of unit this task targets.
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Returns the type identifier of the unit this task targets.
    pub fn type_id(&self) -> &str {
        &self.type_id
    }
}

/// A source of tasks for a single worker pool, bound to the pool's task queue.
#[async_trait]
pub trait TaskSource: Send {
    /// Waits for the next task.
    ///
    /// Returns `Ok(None)` once the source is closed.
    ///
    /// # Cancel safety
    ///
    /// Implementations must be cancel safe. The pool stops polling by dropping the future when it begins draining.
    ///
    /// # Errors
    ///
    /// If the underlying transport fails, an error is returned. Transport failures are fatal to the pool.
    async fn next_task(&mut self) -> Result<Option<Task>, GenericError>;
}

/// A task source backed by an in-process channel.
pub struct ChannelTaskSource {
    tasks: mpsc::Receiver<Task>,
}

impl ChannelTaskSource {
    /// Creates a new `ChannelTaskSource` and the sender used to submit tasks to it.
    pub fn new(capacity: usize) -> (mpsc::Sender<Task>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { tasks: rx })
    }
}

#[async_trait]
impl TaskSource for ChannelTaskSource {
    async fn next_task(&mut self) -> Result<Option<Task>, GenericError> {
        Ok(self.tasks.recv().await)
    }
}

/// Creates the task source a worker pool polls, given the pool's task queue.
pub trait TaskSourceFactory {
    /// Creates a task source bound to `task_queue`.
    ///
    /// Returns `Ok(None)` if the pool should only execute units dispatched to it directly.
    ///
    /// # Errors
    ///
    /// If the source for the queue cannot be created, an error is returned.
    fn create(&self, task_queue: &str) -> Result<Option<Box<dyn TaskSource>>, GenericError>;
}

impl<F> TaskSourceFactory for F
where
    F: Fn(&str) -> Result<Option<Box<dyn TaskSource>>, GenericError>,
{
    fn create(&self, task_queue: &str) -> Result<Option<Box<dyn TaskSource>>, GenericError> {
        self(task_queue)
    }
}

/// A task source factory that attaches no task source, leaving pools to serve dispatched units only.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTaskSources;

impl TaskSourceFactory for NoTaskSources {
    fn create(&self, _task_queue: &str) -> Result<Option<Box<dyn TaskSource>>, GenericError> {
        Ok(None)
    }
}

/// A task source factory backed by in-process channels, one per task queue.
///
/// Tasks are submitted through the sender of a queue, available once a pool bound to that queue has been created.
pub struct ChannelTaskSources {
    capacity: usize,
    senders: Mutex<IndexMap<String, mpsc::Sender<Task>>>,
}

impl ChannelTaskSources {
    /// Creates a new `ChannelTaskSources` whose queues each buffer up to `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Mutex::new(IndexMap::new()),
        }
    }

    /// Returns the sender submitting tasks to the given queue, if a pool polls it.
    pub fn sender(&self, task_queue: &str) -> Option<mpsc::Sender<Task>> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_queue)
            .cloned()
    }
}

impl TaskSourceFactory for ChannelTaskSources {
    fn create(&self, task_queue: &str) -> Result<Option<Box<dyn TaskSource>>, GenericError> {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        if senders.contains_key(task_queue) {
            return Err(generic_error!("Task queue '{}' is already polled by another worker pool.", task_queue));
        }

        let (tx, source) = ChannelTaskSource::new(self.capacity);
        senders.insert(task_queue.to_string(), tx);
        Ok(Some(Box::new(source)))
    }
}
