use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use respawn_config::ConfigurationLoader;
use respawn_core::{
    job::{ChannelJobSource, Job, JobOutcome},
    pool::{
        unit_fn, ChannelTaskSources, ExecutionUnit, InterceptorCatalog, NoTaskSources, PoolsConfiguration, Task, UnitKind,
        WorkerOptions, WorkerPool,
    },
    reboot::{CustomStrategies, MaxJobs, RebootConfiguration, RebootStrategy},
    registry::{Assignment, AssignmentTable, PoolDispatcher, WorkerRegistry},
    runtime::{ProcessSupervisor, StopSignal, SupervisorConfiguration, SupervisorError, TerminationReason},
};
use respawn_error::JobError;
use serde_json::{json, Value};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps a strategy and counts how many times it was asked.
struct Counted<S> {
    inner: S,
    evaluations: Arc<AtomicU64>,
}

impl<S: RebootStrategy> RebootStrategy for Counted<S> {
    fn should_reboot(&mut self, outcome: &JobOutcome) -> bool {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        self.inner.should_reboot(outcome)
    }
}

fn activity(id: usize, type_id: &str, input: Value) -> Job {
    Job::new(
        id.to_string(),
        "queue",
        json!({ "kind": "activity", "type": type_id, "input": input }),
    )
}

fn double() -> Arc<dyn ExecutionUnit> {
    Arc::new(unit_fn(|input: Value| async move {
        tokio::task::yield_now().await;
        let n = input.as_u64().unwrap_or_default();
        Ok::<_, JobError>(json!(n * 2))
    }))
}

fn queue_registry(options: WorkerOptions) -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry
        .add_pool(WorkerPool::new("default", options).unwrap())
        .unwrap();
    registry.register_mode("queue", PoolDispatcher).unwrap();
    registry
        .register_activity_type("Double", double(), &Assignment::AllPools)
        .unwrap();
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_are_counted_exactly() {
    let options = WorkerOptions {
        max_concurrent_activity_execution_size: 0,
        ..WorkerOptions::default()
    };
    let registry = Arc::new(queue_registry(options));

    let reboot_config = RebootConfiguration {
        strategy: vec!["max_jobs".to_string()],
        max_jobs: 1000,
        max_jobs_dispersion: 0.0,
        ..RebootConfiguration::default()
    };
    let evaluations = Arc::new(AtomicU64::new(0));
    let strategy = Counted {
        inner: reboot_config.build(&CustomStrategies::default()).unwrap(),
        evaluations: Arc::clone(&evaluations),
    };

    let mut supervisor = ProcessSupervisor::new(
        Arc::clone(&registry),
        Box::new(strategy),
        SupervisorConfiguration::default().with_max_in_flight_jobs(64),
    );

    let (jobs, source) = ChannelJobSource::new(1024);
    let (source, mut responses) = source.with_responses();
    for i in 0..1000 {
        jobs.send(activity(i, "Double", json!(i))).await.unwrap();
    }

    let termination = timeout(TEST_TIMEOUT, supervisor.run(source, StopSignal::never()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(termination.reason(), TerminationReason::RebootRequested);
    assert_eq!(termination.jobs_completed(), 1000);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1000);
    assert_eq!(registry.pool("default").unwrap().stats().completed, 1000);

    let mut delivered = 0;
    while let Ok((_, outcome)) = responses.try_recv() {
        assert_eq!(outcome, JobOutcome::Success);
        delivered += 1;
    }
    assert_eq!(delivered, 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completions_across_pools_are_counted_exactly() {
    let config = ConfigurationLoader::default()
        .from_yaml_str(
            r#"
workers:
  alpha:
    queue: alpha-tasks
    options:
      max_concurrent_activity_execution_size: 0
  beta:
    queue: beta-tasks
    options:
      max_concurrent_activity_execution_size: 16
"#,
        )
        .unwrap()
        .into_generic();
    let pools = PoolsConfiguration::from_configuration(&config).unwrap();
    let task_sources = ChannelTaskSources::new(512);
    let mut registry =
        WorkerRegistry::from_configuration(&pools, &InterceptorCatalog::default(), &task_sources).unwrap();
    registry.register_mode("queue", PoolDispatcher).unwrap();
    registry
        .register_activity_type("Double", double(), &Assignment::AllPools)
        .unwrap();
    let registry = Arc::new(registry);

    let evaluations = Arc::new(AtomicU64::new(0));
    let strategy = Counted {
        inner: MaxJobs::new(1000, 0.0).unwrap(),
        evaluations: Arc::clone(&evaluations),
    };
    let mut supervisor = ProcessSupervisor::new(
        Arc::clone(&registry),
        Box::new(strategy),
        SupervisorConfiguration::default().with_max_in_flight_jobs(32),
    );

    // 300 tasks polled by each pool, and 400 jobs dispatched by the supervisor, split between the pools.
    let alpha = task_sources.sender("alpha-tasks").unwrap();
    let beta = task_sources.sender("beta-tasks").unwrap();
    for i in 0..300 {
        alpha
            .send(Task::new(format!("alpha-{i}"), UnitKind::Activity, "Double", json!(i)))
            .await
            .unwrap();
        beta.send(Task::new(format!("beta-{i}"), UnitKind::Activity, "Double", json!(i)))
            .await
            .unwrap();
    }

    let (jobs, source) = ChannelJobSource::new(512);
    let (source, mut responses) = source.with_responses();
    for i in 0..400 {
        let pool = if i % 2 == 0 { "alpha" } else { "beta" };
        let payload = json!({ "kind": "activity", "type": "Double", "pool": pool, "input": i });
        jobs.send(Job::new(format!("job-{i}"), "queue", payload)).await.unwrap();
    }

    let termination = timeout(TEST_TIMEOUT, supervisor.run(source, StopSignal::never()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(termination.reason(), TerminationReason::RebootRequested);
    assert_eq!(termination.jobs_completed(), 1000);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1000);

    let alpha_stats = registry.pool("alpha").unwrap().stats();
    let beta_stats = registry.pool("beta").unwrap().stats();
    assert_eq!(alpha_stats.completed, 500);
    assert_eq!(beta_stats.completed, 500);
    assert_eq!(alpha_stats.failed + beta_stats.failed, 0);

    let mut delivered = 0;
    while let Ok((_, outcome)) = responses.try_recv() {
        assert_eq!(outcome, JobOutcome::Success);
        delivered += 1;
    }
    assert_eq!(delivered, 400);
    drop(jobs);
}

#[tokio::test]
async fn configured_worker_reboots_on_untolerated_failures() {
    let config = ConfigurationLoader::default()
        .from_yaml_str(
            r#"
kernel_reboot:
  strategy: [on_exception, max_jobs]
  allowed_exceptions: [unknown_type]
  max_jobs: 100
  max_jobs_dispersion: 0.0
supervisor:
  mode: queue
workers:
  billing:
    queue: billing-tasks
    interceptors: [logging, metrics]
    options:
      max_concurrent_activity_execution_size: 2
assignments:
  activities:
    Double: billing
"#,
        )
        .unwrap()
        .into_generic();

    let pools = PoolsConfiguration::from_configuration(&config).unwrap();
    let mut registry =
        WorkerRegistry::from_configuration(&pools, &InterceptorCatalog::default(), &NoTaskSources).unwrap();
    registry.register_mode("queue", PoolDispatcher).unwrap();

    let assignments = AssignmentTable::from_configuration(&config).unwrap();
    registry
        .register_activity_type(
            "Double",
            Arc::new(unit_fn(|input: Value| async move {
                match input.as_u64() {
                    Some(n) => Ok(json!(n * 2)),
                    None => Err(JobError::msg("bad_input", "expected a number")),
                }
            })),
            &assignments.assignment(UnitKind::Activity, "Double"),
        )
        .unwrap();
    let registry = Arc::new(registry);
    assert_eq!(registry.pool("billing").unwrap().task_queue(), "billing-tasks");

    let strategy = RebootConfiguration::from_configuration(&config)
        .unwrap()
        .build(&CustomStrategies::default())
        .unwrap();
    let supervisor_config = SupervisorConfiguration::from_configuration(&config).unwrap();
    let mut supervisor = ProcessSupervisor::new(registry, strategy, supervisor_config);

    let (jobs, source) = ChannelJobSource::new(16);
    let (source, mut responses) = source.with_responses();
    jobs.send(activity(0, "Double", json!(2))).await.unwrap();
    // Tolerated: the type is unknown.
    jobs.send(activity(1, "Triple", json!(2))).await.unwrap();
    // Not tolerated.
    jobs.send(activity(2, "Double", json!("two"))).await.unwrap();
    jobs.send(activity(3, "Double", json!(3))).await.unwrap();

    let termination = timeout(TEST_TIMEOUT, supervisor.run(source, StopSignal::never()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(termination.reason(), TerminationReason::RebootRequested);
    assert_eq!(termination.jobs_completed(), 3);

    let mut outcomes = Vec::new();
    while let Ok((id, outcome)) = responses.try_recv() {
        outcomes.push((id.to_string(), outcome));
    }
    assert_eq!(
        outcomes,
        vec![
            ("0".to_string(), JobOutcome::Success),
            ("1".to_string(), JobOutcome::Failure("unknown_type".into())),
            ("2".to_string(), JobOutcome::Failure("bad_input".into())),
        ]
    );
}

#[tokio::test]
async fn stop_before_any_job_exits_cleanly() {
    let registry = Arc::new(queue_registry(WorkerOptions::default()));
    let strategy = RebootConfiguration::default()
        .build(&CustomStrategies::default())
        .unwrap();
    let mut supervisor = ProcessSupervisor::new(registry, strategy, SupervisorConfiguration::default());

    let (_jobs, source) = ChannelJobSource::new(4);
    let termination = timeout(TEST_TIMEOUT, supervisor.run_with_shutdown(source, async {}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(termination.reason(), TerminationReason::StopRequested);
    assert_eq!(termination.jobs_completed(), 0);
}

#[tokio::test]
async fn missing_mode_handler_is_a_startup_error() {
    let registry = Arc::new(WorkerRegistry::new());
    let strategy = RebootConfiguration::default()
        .build(&CustomStrategies::default())
        .unwrap();
    let mut supervisor = ProcessSupervisor::new(registry, strategy, SupervisorConfiguration::default());

    let (_jobs, source) = ChannelJobSource::new(4);
    let result = supervisor.run(source, StopSignal::never()).await;
    assert!(matches!(result, Err(SupervisorError::Registry { .. })));
}
