use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use metrics::{counter, histogram};
use respawn_error::JobError;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ExecutionUnit, PoolError, UnitContext};

/// Wraps the execution of every unit in a worker pool.
///
/// Interceptors run in the order they were configured for the pool. Each decides whether, and with what input, to
/// call the rest of the chain through [`Next::run`].
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Intercepts a single unit execution.
    ///
    /// # Errors
    ///
    /// If the unit fails, or the interceptor itself rejects the execution, an error is returned.
    async fn intercept(&self, ctx: &UnitContext, input: Value, next: Next<'_>) -> Result<Value, JobError>;
}

/// The remainder of an interceptor chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    unit: &'a dyn ExecutionUnit,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], unit: &'a dyn ExecutionUnit) -> Self {
        Self { chain, unit }
    }

    /// Runs the next interceptor in the chain or, at the end of the chain, the unit itself.
    ///
    /// # Errors
    ///
    /// If the unit or any remaining interceptor fails, an error is returned.
    pub async fn run(self, ctx: &UnitContext, input: Value) -> Result<Value, JobError> {
        match self.chain.split_first() {
            Some((interceptor, rest)) => {
                interceptor
                    .intercept(ctx, input, Next::new(rest, self.unit))
                    .await
            }
            None => self.unit.execute(ctx, input).await,
        }
    }
}

/// Logs the start and end of every unit execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl Interceptor for LoggingInterceptor {
    async fn intercept(&self, ctx: &UnitContext, input: Value, next: Next<'_>) -> Result<Value, JobError> {
        debug!(pool = ctx.pool(), kind = %ctx.kind(), type_id = ctx.type_id(), task_id = %ctx.task_id(), "Executing unit.");

        let started = Instant::now();
        let result = next.run(ctx, input).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => debug!(
                pool = ctx.pool(),
                type_id = ctx.type_id(),
                task_id = %ctx.task_id(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Unit completed."
            ),
            Err(e) => warn!(
                pool = ctx.pool(),
                type_id = ctx.type_id(),
                task_id = %ctx.task_id(),
                error_kind = %e.kind(),
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e.source_error(),
                "Unit failed."
            ),
        }

        result
    }
}

/// Records a count and duration for every unit execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsInterceptor;

#[async_trait]
impl Interceptor for MetricsInterceptor {
    async fn intercept(&self, ctx: &UnitContext, input: Value, next: Next<'_>) -> Result<Value, JobError> {
        let started = Instant::now();
        let result = next.run(ctx, input).await;

        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!(
            "respawn_pool_units_total",
            "pool" => ctx.pool().to_string(),
            "unit_kind" => ctx.kind().as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(
            "respawn_pool_unit_duration_seconds",
            "pool" => ctx.pool().to_string(),
            "unit_kind" => ctx.kind().as_str()
        )
        .record(started.elapsed().as_secs_f64());

        result
    }
}

/// Named interceptors that worker pools can reference from configuration.
///
/// The catalog starts out with the built-in `logging` and `metrics` interceptors.
#[derive(Clone)]
pub struct InterceptorCatalog {
    interceptors: IndexMap<String, Arc<dyn Interceptor>>,
}

impl Default for InterceptorCatalog {
    fn default() -> Self {
        let mut catalog = Self {
            interceptors: IndexMap::new(),
        };
        catalog.register("logging", LoggingInterceptor);
        catalog.register("metrics", MetricsInterceptor);
        catalog
    }
}

impl InterceptorCatalog {
    /// Registers an interceptor under the given name, replacing any previous registration.
    pub fn register<N, I>(&mut self, name: N, interceptor: I)
    where
        N: Into<String>,
        I: Interceptor + 'static,
    {
        self.interceptors.insert(name.into(), Arc::new(interceptor));
    }

    /// Resolves a list of interceptor names, preserving their order.
    ///
    /// # Errors
    ///
    /// If any name is not in the catalog, an error is returned.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn Interceptor>>, PoolError> {
        names
            .iter()
            .map(|name| {
                self.interceptors
                    .get(name.as_ref())
                    .cloned()
                    .ok_or_else(|| PoolError::UnknownInterceptor {
                        name: name.as_ref().to_string(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::{job::JobId, pool::unit_fn, pool::UnitKind};

    struct Recording {
        label: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recording {
        async fn intercept(&self, ctx: &UnitContext, input: Value, next: Next<'_>) -> Result<Value, JobError> {
            self.calls.lock().unwrap().push(format!("{}:before", self.label));
            let result = next.run(ctx, input).await;
            self.calls.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Interceptor for Rejecting {
        async fn intercept(&self, _ctx: &UnitContext, _input: Value, _next: Next<'_>) -> Result<Value, JobError> {
            Err(JobError::msg("rejected", "not allowed"))
        }
    }

    fn context() -> UnitContext {
        UnitContext::new("default".into(), UnitKind::Activity, "Echo", JobId::new("t-1"))
    }

    #[tokio::test]
    async fn chain_runs_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recording {
                label: "outer",
                calls: Arc::clone(&calls),
            }),
            Arc::new(Recording {
                label: "inner",
                calls: Arc::clone(&calls),
            }),
        ];
        let unit = unit_fn(|input| async move { Ok::<_, JobError>(input) });

        let result = Next::new(&chain, &unit).run(&context(), json!("hi")).await.unwrap();
        assert_eq!(result, json!("hi"));
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let chain: Vec<Arc<dyn Interceptor>> = vec![Arc::new(Rejecting)];
        let unit = unit_fn(|input| async move { Ok::<_, JobError>(json!({ "ran": input })) });

        let err = Next::new(&chain, &unit).run(&context(), Value::Null).await.unwrap_err();
        assert_eq!(err.kind().as_str(), "rejected");
    }

    #[test]
    fn catalog_resolves_builtins_in_order() {
        let catalog = InterceptorCatalog::default();
        let resolved = catalog.resolve(&["metrics", "logging"]).unwrap();
        assert_eq!(resolved.len(), 2);

        assert!(matches!(
            catalog.resolve(&["tracing"]),
            Err(PoolError::UnknownInterceptor { name }) if name == "tracing"
        ));
    }
}
