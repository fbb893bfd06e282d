use respawn_app::prelude::update_pid_file;
use respawn_config::GenericConfiguration;
use respawn_core::{pool::UnitKind, runtime::Termination};
use respawn_error::{ErrorContext as _, GenericError};
use tracing::{info, warn};

use crate::{config::RunConfig, stdio::StdioJobSource, worker::build_supervisor};

/// Entrypoint for the `run` command.
pub async fn handle_run_command(config: GenericConfiguration, run_config: RunConfig) -> Result<Termination, GenericError> {
    info!(process_id = std::process::id(), "Worker starting.");

    if let Some(pid_file) = &run_config.pid_file {
        update_pid_file(pid_file)?;
    }

    let mut supervisor = build_supervisor(&config)?;
    let termination = supervisor
        .run_with_shutdown(StdioJobSource::stdio(), shutdown_signal())
        .await
        .error_context("Worker failed.")?;

    info!(
        reason = ?termination.reason(),
        jobs_completed = termination.jobs_completed(),
        forced = termination.forced(),
        "Worker exiting."
    );
    Ok(termination)
}

/// Entrypoint for the `check-config` command.
pub fn handle_check_config_command(config: GenericConfiguration) -> Result<(), GenericError> {
    let supervisor = build_supervisor(&config)?;

    for pool in supervisor.registry().pools() {
        info!(
            pool = pool.name(),
            task_queue = pool.task_queue(),
            activities = ?pool.registered_types(UnitKind::Activity),
            workflows = ?pool.registered_types(UnitKind::Workflow),
            "Worker pool configured."
        );
    }
    info!("Configuration is valid.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT."),
                    _ = sigterm.recv() => info!("Received SIGTERM."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler. Only SIGINT will stop the worker."),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for SIGINT. The worker can only stop on its own.");
        std::future::pending::<()>().await;
    }
}
