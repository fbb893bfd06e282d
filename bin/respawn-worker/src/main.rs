//! Worker binary.
//!
//! Reads jobs from standard input, runs them through the configured worker pools, and writes results to standard
//! output. Once the reboot strategy asks for it, or the process is signalled, the worker drains and exits so that its
//! process manager can start a fresh one.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use respawn_app::prelude::*;
use tracing::error;

mod builtin;

mod config;
use self::config::{Action, Cli};

mod run;
use self::run::{handle_check_config_command, handle_run_command};

mod stdio;

mod worker;
use self::worker::load_configuration;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match &cli.action {
        Action::Run(run_config) => run_config.config.clone(),
        Action::CheckConfig(check_config) => check_config.config.clone(),
    };
    let configuration = load_configuration(&config_path)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));
    let logging_config = LoggingConfiguration::from_configuration(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("invalid logging configuration: {:?}", e)));
    let guard = initialize_logging(&logging_config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {:?}", e)));

    let exit_code = match cli.action {
        Action::Run(run_config) => match handle_run_command(configuration, run_config).await {
            Ok(_) => 0,
            Err(e) => {
                error!("{:?}", e);
                1
            }
        },
        Action::CheckConfig(_) => match handle_check_config_command(configuration) {
            Ok(()) => 0,
            Err(e) => {
                error!("{:?}", e);
                1
            }
        },
    };

    // Flush buffered logs, then exit without waiting on the runtime: a pending read of standard input would otherwise
    // keep it alive.
    drop(guard);
    std::process::exit(exit_code);
}
