use std::{future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt as _;
use indexmap::IndexMap;
use metrics::counter;
use respawn_config::{ConfigurationError, GenericConfiguration};
use respawn_error::{ErrorKind, GenericError, JobError};
use serde_json::Value;
use snafu::{ResultExt as _, Snafu};
use tokio::{
    pin, select,
    sync::mpsc,
    task::{Id, JoinError, JoinSet},
};
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument as _};

use super::shutdown::StopSignal;
use crate::{
    job::{CompletedJob, Job, JobId, JobOutcome, JobSource, OutcomeSender},
    pool::PoolError,
    reboot::RebootStrategy,
    registry::{RegistryError, WorkerRegistry, UNKNOWN_MODE},
};

const DEFAULT_MODE: &str = "queue";
const DEFAULT_MAX_IN_FLIGHT_JOBS: usize = 1;

/// Error kind reported to the job source for jobs abandoned when the drain timeout expired.
pub const ABORTED: &str = "aborted";

/// Supervisor errors.
///
/// Every variant is fatal to the worker process. By the time one is returned, the supervisor has already drained.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SupervisorError {
    /// The supervisor was run more than once.
    #[snafu(display("Supervisor has already been run."))]
    AlreadyRun,

    /// The configured mode has no handler.
    #[snafu(display("Supervisor cannot start: {}", source))]
    Registry {
        /// The underlying registry error.
        source: RegistryError,
    },

    /// The job source failed.
    #[snafu(display("Job source failed: {}", source))]
    Source {
        /// The error returned by the job source.
        source: GenericError,
    },

    /// A worker pool failed.
    #[snafu(display("Worker pool failed: {}", source))]
    Pool {
        /// The underlying pool error.
        source: PoolError,
    },

    /// A worker pool task panicked or was aborted.
    #[snafu(display("Worker pool task exited abnormally: {}", source))]
    PoolTask {
        /// The underlying join error.
        source: JoinError,
    },
}

/// Lifecycle state of a supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not yet running.
    Idle,

    /// Accepting and dispatching jobs.
    Running,

    /// No longer accepting jobs, waiting for in-flight work to finish.
    Draining,

    /// Finished. The process should exit.
    Terminated,
}

/// Why a supervisor stopped running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// The reboot strategy asked for the process to be replaced.
    RebootRequested,

    /// An external stop was requested.
    StopRequested,

    /// The job source closed.
    SourceClosed,
}

/// Summary of a supervisor run that ended without a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Termination {
    reason: TerminationReason,
    jobs_completed: u64,
    forced: bool,
}

impl Termination {
    /// Returns why the supervisor stopped.
    pub fn reason(&self) -> TerminationReason {
        self.reason
    }

    /// Returns the number of completed jobs the reboot strategy observed.
    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    /// Returns `true` if the drain timeout expired and in-flight work was abandoned.
    pub fn forced(&self) -> bool {
        self.forced
    }
}

/// Supervisor configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorConfiguration {
    mode: String,
    max_in_flight_jobs: usize,
    drain_timeout: Option<Duration>,
}

impl Default for SupervisorConfiguration {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE.to_string(),
            max_in_flight_jobs: DEFAULT_MAX_IN_FLIGHT_JOBS,
            drain_timeout: None,
        }
    }
}

impl SupervisorConfiguration {
    /// Creates a new `SupervisorConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If a value in the `supervisor` section has the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let mut supervisor_config = Self::default();

        if let Some(mode) = config.try_get_typed::<String>("supervisor.mode")? {
            supervisor_config = supervisor_config.with_mode(mode);
        }
        if let Some(max_in_flight_jobs) = config.try_get_typed::<usize>("supervisor.max_in_flight_jobs")? {
            supervisor_config = supervisor_config.with_max_in_flight_jobs(max_in_flight_jobs);
        }
        if let Some(secs) = config.try_get_typed::<u64>("supervisor.drain_timeout_secs")? {
            supervisor_config = supervisor_config.with_drain_timeout(Duration::from_secs(secs));
        }

        Ok(supervisor_config)
    }

    /// Sets the mode this worker process serves.
    pub fn with_mode<M: Into<String>>(mut self, mode: M) -> Self {
        self.mode = mode.into();
        self
    }

    /// Sets how many jobs may be dispatched at once. Values below one are raised to one.
    pub fn with_max_in_flight_jobs(mut self, max_in_flight_jobs: usize) -> Self {
        self.max_in_flight_jobs = max_in_flight_jobs.max(1);
        self
    }

    /// Sets how long draining may take before in-flight work is abandoned.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = Some(drain_timeout);
        self
    }

    /// Returns the mode this worker process serves.
    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// Returns how many jobs may be dispatched at once.
    pub fn max_in_flight_jobs(&self) -> usize {
        self.max_in_flight_jobs
    }

    /// Returns the drain timeout, if any.
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout
    }
}

enum Exit {
    Reboot,
    Stop,
    SourceClosed,
    Fault(SupervisorError),
}

/// A dispatched job whose task has ended.
struct FinishedJob {
    id: JobId,
    result: Result<Value, JobError>,
    aborted: bool,
}

/// Work the supervisor is waiting on: dispatched jobs, running pools, and pool outcomes.
struct WorkState {
    jobs: JoinSet<Result<Value, JobError>>,
    job_ids: IndexMap<Id, JobId>,
    pools: JoinSet<Result<(), PoolError>>,
    outcomes: mpsc::UnboundedReceiver<CompletedJob>,
}

impl WorkState {
    fn new(outcomes: mpsc::UnboundedReceiver<CompletedJob>) -> Self {
        Self {
            jobs: JoinSet::new(),
            job_ids: IndexMap::new(),
            pools: JoinSet::new(),
            outcomes,
        }
    }

    fn spawn_pool(&mut self, registry: &Arc<WorkerRegistry>, name: String, outcomes: OutcomeSender) {
        let registry = Arc::clone(registry);
        let span = info_span!("pool", pool = %name);
        self.pools.spawn(
            async move {
                match registry.pool(&name) {
                    Some(pool) => pool.start(outcomes).await,
                    None => Ok(()),
                }
            }
            .instrument(span),
        );
    }

    fn spawn_job(&mut self, registry: &Arc<WorkerRegistry>, job: Job) {
        let registry = Arc::clone(registry);
        let id = job.id().clone();
        let span = debug_span!("job", job_id = %id, mode = job.mode());

        let handle = self.jobs.spawn(
            async move {
                let handler = match registry.resolve(job.mode()) {
                    Ok(handler) => handler,
                    Err(e) => return Err(JobError::new(UNKNOWN_MODE, e)),
                };

                match AssertUnwindSafe(handler.handle(job, &registry)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(JobError::from_panic(payload.as_ref())),
                }
            }
            .instrument(span),
        );

        self.job_ids.insert(handle.id(), id);
    }

    fn finish_job(&mut self, joined: Result<(Id, Result<Value, JobError>), JoinError>) -> Option<FinishedJob> {
        let (task_id, result, aborted) = match joined {
            Ok((task_id, result)) => (task_id, result, false),
            Err(e) if e.is_cancelled() => (
                e.id(),
                Err(JobError::msg(ABORTED, "Job was abandoned when the drain timeout expired.")),
                true,
            ),
            Err(e) => (e.id(), Err(JobError::msg(ErrorKind::PANIC, e.to_string())), false),
        };

        match self.job_ids.swap_remove(&task_id) {
            Some(id) => Some(FinishedJob { id, result, aborted }),
            None => {
                error!(?task_id, "Completed job task was not tracked.");
                None
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.pools.is_empty()
    }

    /// Aborts all in-flight work, returning every job that was still tracked.
    ///
    /// Jobs that finished before the abort took effect keep their result.
    async fn abandon(&mut self) -> Vec<FinishedJob> {
        self.jobs.abort_all();
        let mut finished = Vec::with_capacity(self.jobs.len());
        while let Some(joined) = self.jobs.join_next_with_id().await {
            finished.extend(self.finish_job(joined));
        }
        self.pools.shutdown().await;
        finished
    }
}

fn pool_exit(joined: Result<Result<(), PoolError>, JoinError>) -> Option<SupervisorError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(source)) => Some(SupervisorError::Pool { source }),
        Err(source) => Some(SupervisorError::PoolTask { source }),
    }
}

/// Drives a worker process from start to termination.
///
/// The supervisor pulls jobs from a [`JobSource`], dispatches each to the handler registered for its mode, and runs every
/// worker pool in the registry. Every completed job, whether dispatched by the supervisor or executed by a pool from its
/// own task source, is reported back to the supervisor, which evaluates the reboot strategy exactly once per job, one
/// job at a time.
///
/// When the strategy asks for a reboot, an external stop is requested, or the job source closes, the supervisor stops
/// accepting jobs, stops every pool, and waits for in-flight work to finish before returning.
pub struct ProcessSupervisor {
    registry: Arc<WorkerRegistry>,
    strategy: Box<dyn RebootStrategy>,
    config: SupervisorConfiguration,
    state: SupervisorState,
    jobs_completed: u64,
}

impl ProcessSupervisor {
    /// Creates a new `ProcessSupervisor`.
    pub fn new(
        registry: Arc<WorkerRegistry>, strategy: Box<dyn RebootStrategy>, config: SupervisorConfiguration,
    ) -> Self {
        Self {
            registry,
            strategy,
            config,
            state: SupervisorState::Idle,
            jobs_completed: 0,
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Returns the number of completed jobs observed so far.
    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    /// Returns the registry this supervisor runs.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn evaluate(&mut self, completed: &CompletedJob) -> bool {
        self.jobs_completed += 1;

        let outcome = completed.outcome();
        counter!("respawn_jobs_completed_total", "outcome" => outcome.label()).increment(1);
        match outcome {
            JobOutcome::Success => debug!(job_id = %completed.id(), "Job completed."),
            JobOutcome::Failure(kind) => warn!(job_id = %completed.id(), error_kind = %kind, "Job failed."),
        }

        let reboot = self.strategy.should_reboot(outcome);
        if reboot && self.state == SupervisorState::Running {
            counter!("respawn_reboot_decisions_total").increment(1);
            info!(
                job_id = %completed.id(),
                jobs_completed = self.jobs_completed,
                "Reboot strategy requested a reboot."
            );
        }
        reboot
    }

    /// Runs the supervisor until the process should terminate.
    ///
    /// # Errors
    ///
    /// If the supervisor was already run, the configured mode has no handler, the job source fails, or a worker pool
    /// fails, an error is returned. Faults that occur after startup are only returned once in-flight work has drained.
    pub async fn run<S: JobSource>(&mut self, mut source: S, mut stop: StopSignal) -> Result<Termination, SupervisorError> {
        if self.state != SupervisorState::Idle {
            return Err(SupervisorError::AlreadyRun);
        }

        if let Err(e) = self.registry.resolve(self.config.mode()).context(Registry) {
            self.state = SupervisorState::Terminated;
            return Err(e);
        }

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let mut work = WorkState::new(outcomes_rx);
        let pool_names = self
            .registry
            .pools()
            .map(|pool| pool.name().to_string())
            .collect::<Vec<_>>();
        for name in pool_names {
            work.spawn_pool(&self.registry, name, outcomes_tx.clone());
        }
        drop(outcomes_tx);

        self.state = SupervisorState::Running;
        info!(
            mode = self.config.mode(),
            max_in_flight_jobs = self.config.max_in_flight_jobs(),
            pools = work.pools.len(),
            "Supervisor running."
        );

        let max_in_flight_jobs = self.config.max_in_flight_jobs();
        let exit = loop {
            select! {
                // Stop requests and completions take priority over new jobs, so that no job is accepted once the
                // process has decided to terminate.
                biased;

                _ = stop.wait() => break Exit::Stop,

                Some(completed) = work.outcomes.recv() => {
                    if self.evaluate(&completed) {
                        break Exit::Reboot;
                    }
                },

                Some(joined) = work.jobs.join_next_with_id(), if !work.jobs.is_empty() => {
                    let Some(FinishedJob { id, result, .. }) = work.finish_job(joined) else { continue };

                    if let Err(source) = source.respond(&id, &result).await {
                        // The outcome still counts, even though it could not be delivered.
                        self.evaluate(&CompletedJob::new(id, JobOutcome::from_result(&result)));
                        break Exit::Fault(SupervisorError::Source { source });
                    }

                    if self.evaluate(&CompletedJob::new(id, JobOutcome::from_result(&result))) {
                        break Exit::Reboot;
                    }
                },

                Some(joined) = work.pools.join_next(), if !work.pools.is_empty() => {
                    if let Some(fault) = pool_exit(joined) {
                        break Exit::Fault(fault);
                    }
                },

                next = source.next_job(), if work.jobs.len() < max_in_flight_jobs => match next {
                    Ok(Some(job)) => {
                        debug!(job_id = %job.id(), mode = job.mode(), "Dispatching job.");
                        work.spawn_job(&self.registry, job);
                    },
                    Ok(None) => break Exit::SourceClosed,
                    Err(source) => break Exit::Fault(SupervisorError::Source { source }),
                },
            }
        };

        let (reason, mut fault) = match exit {
            Exit::Reboot => (TerminationReason::RebootRequested, None),
            Exit::Stop => (TerminationReason::StopRequested, None),
            Exit::SourceClosed => (TerminationReason::SourceClosed, None),
            Exit::Fault(e) => {
                error!(error = %e, "Supervisor encountered a fatal fault.");
                (TerminationReason::StopRequested, Some(e))
            }
        };

        self.state = SupervisorState::Draining;
        info!(
            ?reason,
            in_flight_jobs = work.jobs.len(),
            "Supervisor draining."
        );
        self.registry.stop_pools();

        let forced = self.drain(&mut source, &mut work, &mut fault).await;

        self.state = SupervisorState::Terminated;
        info!(jobs_completed = self.jobs_completed, forced, "Supervisor terminated.");

        match fault {
            Some(e) => Err(e),
            None => Ok(Termination {
                reason,
                jobs_completed: self.jobs_completed,
                forced,
            }),
        }
    }

    /// Runs the supervisor until the process should terminate, or `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_shutdown<S, F>(&mut self, source: S, shutdown: F) -> Result<Termination, SupervisorError>
    where
        S: JobSource,
        F: Future + Send + 'static,
    {
        self.run(source, StopSignal::from_future(shutdown)).await
    }

    /// Waits for in-flight jobs and pools to finish, returning `true` if the drain timeout forced them to be abandoned.
    async fn drain<S: JobSource>(
        &mut self, source: &mut S, work: &mut WorkState, fault: &mut Option<SupervisorError>,
    ) -> bool {
        let drain_timeout = self.config.drain_timeout();
        let deadline = async move {
            match drain_timeout {
                Some(drain_timeout) => tokio::time::sleep(drain_timeout).await,
                None => std::future::pending().await,
            }
        };
        pin!(deadline);

        let mut forced = false;
        while !work.is_idle() {
            select! {
                _ = &mut deadline => {
                    warn!(
                        abandoned_jobs = work.jobs.len(),
                        "Drain timeout expired. Abandoning in-flight work."
                    );
                    for finished in work.abandon().await {
                        self.settle(source, finished, fault).await;
                    }
                    forced = true;
                },

                Some(completed) = work.outcomes.recv() => {
                    self.evaluate(&completed);
                },

                Some(joined) = work.jobs.join_next_with_id(), if !work.jobs.is_empty() => {
                    if let Some(finished) = work.finish_job(joined) {
                        self.settle(source, finished, fault).await;
                    }
                },

                Some(joined) = work.pools.join_next(), if !work.pools.is_empty() => {
                    if let Some(pool_fault) = pool_exit(joined) {
                        error!(error = %pool_fault, "Worker pool failed while draining.");
                        fault.get_or_insert(pool_fault);
                    }
                },
            }
        }

        // Every pool has stopped, so all outcomes they will ever report are already queued.
        while let Ok(completed) = work.outcomes.try_recv() {
            self.evaluate(&completed);
        }

        forced
    }

    /// Delivers the result of a job finished while draining, and evaluates it unless it was abandoned.
    async fn settle<S: JobSource>(
        &mut self, source: &mut S, finished: FinishedJob, fault: &mut Option<SupervisorError>,
    ) {
        let FinishedJob { id, result, aborted } = finished;

        // Once the transport has failed, further responses are pointless.
        if fault.is_none() {
            if let Err(source) = source.respond(&id, &result).await {
                error!(error = %source, "Failed to deliver job result while draining.");
                *fault = Some(SupervisorError::Source { source });
            }
        }

        if !aborted {
            self.evaluate(&CompletedJob::new(id, JobOutcome::from_result(&result)));
        }
    }
}
