//! Jobs, their outcomes, and where they come from.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use respawn_error::{ErrorKind, GenericError, JobError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::registry::WorkerRegistry;

/// Identifier of a job, as assigned by whoever submitted it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Arc<str>);

impl JobId {
    /// Creates a new `JobId`.
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(id.as_ref().into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

/// A unit of work handed to the worker process.
///
/// The mode selects which [`JobHandler`] processes the job, and the payload is opaque to everything but that handler.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Job {
    id: JobId,
    mode: String,
    #[serde(default)]
    payload: Value,
}

impl Job {
    /// Creates a new `Job`.
    pub fn new<I, M>(id: I, mode: M, payload: Value) -> Self
    where
        I: Into<JobId>,
        M: Into<String>,
    {
        Self {
            id: id.into(),
            mode: mode.into(),
            payload,
        }
    }

    /// Returns the job identifier.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the mode this job should be dispatched under.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Returns the job payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consumes the job, returning its payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }
}

/// Result of processing a single job, as seen by reboot strategies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job completed successfully.
    Success,

    /// The job failed with an error of the given kind.
    Failure(ErrorKind),
}

impl JobOutcome {
    /// Derives the outcome of a job from its result.
    pub fn from_result<T>(result: &Result<T, JobError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::Failure(e.kind().clone()),
        }
    }

    /// Returns `true` if the job failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns the error kind, if the job failed.
    pub fn error_kind(&self) -> Option<&ErrorKind> {
        match self {
            Self::Success => None,
            Self::Failure(kind) => Some(kind),
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
        }
    }
}

/// A job that has finished, successfully or not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedJob {
    id: JobId,
    outcome: JobOutcome,
}

impl CompletedJob {
    /// Creates a new `CompletedJob`.
    pub fn new(id: JobId, outcome: JobOutcome) -> Self {
        Self { id, outcome }
    }

    /// Returns the identifier of the completed job.
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Returns the outcome of the completed job.
    pub fn outcome(&self) -> &JobOutcome {
        &self.outcome
    }
}

/// Sending half of the channel over which completed jobs are reported to the supervisor.
pub type OutcomeSender = mpsc::UnboundedSender<CompletedJob>;

/// A source of jobs.
///
/// The job source is the transport between the worker process and whatever hands it work. A failing job source is a
/// transport fault, which is fatal to the process: job-level failures are reported through [`JobSource::respond`]
/// instead.
#[async_trait]
pub trait JobSource: Send {
    /// Waits for the next job.
    ///
    /// Returns `Ok(None)` once the source is closed and no further jobs will arrive.
    ///
    /// # Cancel safety
    ///
    /// Implementations must be cancel safe: the supervisor polls this alongside other events and may drop the future
    /// before it completes. Dropping the future must not lose a job.
    ///
    /// # Errors
    ///
    /// If the underlying transport fails, an error is returned.
    async fn next_job(&mut self) -> Result<Option<Job>, GenericError>;

    /// Delivers the result of a job back to its submitter.
    ///
    /// # Errors
    ///
    /// If the underlying transport fails, an error is returned.
    async fn respond(&mut self, id: &JobId, result: &Result<Value, JobError>) -> Result<(), GenericError>;
}

/// Processes jobs of a particular mode.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles a single job.
    ///
    /// # Errors
    ///
    /// If the job fails, an error describing the failure is returned.
    async fn handle(&self, job: Job, registry: &WorkerRegistry) -> Result<Value, JobError>;
}

/// A job source backed by an in-process channel.
///
/// Responses are forwarded to an optional responder channel as `(id, outcome)` pairs.
pub struct ChannelJobSource {
    jobs: mpsc::Receiver<Job>,
    responder: Option<mpsc::UnboundedSender<(JobId, JobOutcome)>>,
}

impl ChannelJobSource {
    /// Creates a new `ChannelJobSource` and the sender used to submit jobs to it.
    ///
    /// The source closes once every sender has been dropped.
    pub fn new(capacity: usize) -> (mpsc::Sender<Job>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                jobs: rx,
                responder: None,
            },
        )
    }

    /// Forwards the outcome of every responded-to job to the returned receiver.
    pub fn with_responses(mut self) -> (Self, mpsc::UnboundedReceiver<(JobId, JobOutcome)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.responder = Some(tx);
        (self, rx)
    }
}

#[async_trait]
impl JobSource for ChannelJobSource {
    async fn next_job(&mut self) -> Result<Option<Job>, GenericError> {
        Ok(self.jobs.recv().await)
    }

    async fn respond(&mut self, id: &JobId, result: &Result<Value, JobError>) -> Result<(), GenericError> {
        if let Some(responder) = &self.responder {
            // Nobody listening anymore is fine: the response is informational.
            let _ = responder.send((id.clone(), JobOutcome::from_result(result)));
        }
        Ok(())
    }
}
