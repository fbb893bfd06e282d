use async_trait::async_trait;
use respawn_error::JobError;
use serde::Deserialize;
use serde_json::Value;

use super::WorkerRegistry;
use crate::{
    job::{Job, JobHandler},
    pool::{UnitKind, UNKNOWN_TYPE},
};

/// Error kind reported for jobs whose payload is not a valid dispatch request.
pub const INVALID_PAYLOAD: &str = "invalid_payload";

/// Error kind reported for jobs naming a pool that does not exist.
pub const UNKNOWN_POOL: &str = "unknown_pool";

#[derive(Deserialize)]
struct DispatchRequest {
    kind: UnitKind,
    #[serde(rename = "type")]
    type_id: String,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    input: Value,
}

/// Routes jobs to worker pools.
///
/// Expects job payloads of the form:
///
/// ```json
/// { "kind": "activity", "type": "ChargeCard", "pool": "billing", "input": { "amount": 100 } }
/// ```
///
/// When `pool` is omitted, the first pool hosting the type executes it.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolDispatcher;

#[async_trait]
impl JobHandler for PoolDispatcher {
    async fn handle(&self, job: Job, registry: &WorkerRegistry) -> Result<Value, JobError> {
        let id = job.id().clone();
        let request: DispatchRequest =
            serde_json::from_value(job.into_payload()).map_err(|e| JobError::new(INVALID_PAYLOAD, e))?;

        let pool = match &request.pool {
            Some(name) => registry
                .pool(name)
                .ok_or_else(|| JobError::msg(UNKNOWN_POOL, format!("Worker pool '{}' does not exist.", name)))?,
            None => registry.find_pool(request.kind, &request.type_id).ok_or_else(|| {
                JobError::msg(
                    UNKNOWN_TYPE,
                    format!("No worker pool hosts {} type '{}'.", request.kind, request.type_id),
                )
            })?,
        };

        pool.execute(id, request.kind, &request.type_id, request.input).await
    }
}
