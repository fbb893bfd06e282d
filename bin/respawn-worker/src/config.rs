use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Runs jobs read from standard input, and exits once the reboot strategy asks for a fresh process.
#[derive(Parser)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Run the worker.
    Run(RunConfig),

    /// Validate a configuration file, then exit.
    #[command(name = "check-config")]
    CheckConfig(CheckConfig),
}

#[derive(Args, Clone, Debug)]
pub struct RunConfig {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Path to the PID file.
    #[arg(short = 'p', long = "pidfile")]
    pub pid_file: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
pub struct CheckConfig {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_pidfile() {
        let cli = Cli::try_parse_from(["respawn-worker", "run", "--config", "worker.yaml", "-p", "/tmp/worker.pid"]).unwrap();
        match cli.action {
            Action::Run(run) => {
                assert_eq!(run.config, PathBuf::from("worker.yaml"));
                assert_eq!(run.pid_file, Some(PathBuf::from("/tmp/worker.pid")));
            }
            Action::CheckConfig(_) => panic!("expected run"),
        }
    }

    #[test]
    fn check_config_requires_a_path() {
        assert!(Cli::try_parse_from(["respawn-worker", "check-config"]).is_err());
        assert!(Cli::try_parse_from(["respawn-worker", "check-config", "-c", "worker.yaml"]).is_ok());
    }
}
