use std::process::ExitCode;

use clap::Parser;
use console_daemon::bootstrap::{self, Daemon};
use console_daemon::cli::Cli;
use console_daemon::dev_tracing;
use tracing::error;

fn main() -> ExitCode {
    let cli = Cli::parse();
    dev_tracing::init_tracing(cli.verbose);

    if cli.kill {
        return match bootstrap::kill_running(&cli.config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "kill failed");
                ExitCode::FAILURE
            }
        };
    }

    let mut daemon = match Daemon::bootstrap(&cli) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}
