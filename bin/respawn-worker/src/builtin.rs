//! Built-in execution units.
//!
//! These cover what a worker needs to be exercised end to end without any application code: echoing input back,
//! sleeping, and failing on request.

use std::{sync::Arc, time::Duration};

use respawn_core::{
    pool::{unit_fn, workflow_factory, UnitKind},
    registry::{AssignmentTable, RegistryError, WorkerRegistry},
};
use respawn_error::{ErrorKind, JobError};
use serde_json::{json, Value};

const INVALID_INPUT: &str = "invalid_input";

/// Registers every built-in unit, placing each according to `assignments`.
pub fn register(registry: &mut WorkerRegistry, assignments: &AssignmentTable) -> Result<(), RegistryError> {
    registry.register_activity_type(
        "Echo",
        Arc::new(unit_fn(echo)),
        &assignments.assignment(UnitKind::Activity, "Echo"),
    )?;
    registry.register_activity_type(
        "Sleep",
        Arc::new(unit_fn(sleep)),
        &assignments.assignment(UnitKind::Activity, "Sleep"),
    )?;
    registry.register_activity_type(
        "Fail",
        Arc::new(unit_fn(fail)),
        &assignments.assignment(UnitKind::Activity, "Fail"),
    )?;
    registry.register_workflow_type(
        "Echo",
        workflow_factory(|| unit_fn(echo)),
        &assignments.assignment(UnitKind::Workflow, "Echo"),
    )?;
    Ok(())
}

async fn echo(input: Value) -> Result<Value, JobError> {
    Ok(input)
}

/// Sleeps for `{"ms": <u64>}` milliseconds.
async fn sleep(input: Value) -> Result<Value, JobError> {
    let ms = input
        .get("ms")
        .and_then(Value::as_u64)
        .ok_or_else(|| JobError::msg(INVALID_INPUT, "Expected input of the form {\"ms\": <milliseconds>}."))?;

    tokio::time::sleep(Duration::from_millis(ms)).await;
    Ok(json!({ "slept_ms": ms }))
}

/// Fails with `{"kind": <error kind>, "message": <message>}`, both optional.
async fn fail(input: Value) -> Result<Value, JobError> {
    let kind = input
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or(ErrorKind::UNCLASSIFIED);
    let message = input
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Failed on request.");

    Err(JobError::msg(kind, message.to_string()))
}
