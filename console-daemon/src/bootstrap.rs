//! Ties the CLI, config file, instance lock, and I/O engine together into
//! a runnable daemon.

use std::path::Path;

use console_core::config::Config;
use console_core::engine::Engine;
use console_core::error::{CoreError, Result};
use console_core::opener::SystemOpener;
use tracing::{error, info};

use crate::cli::Cli;
use crate::lock::InstanceLock;

/// Everything needed to run the main loop, assembled from the CLI and
/// config file. Held together so `main` stays a thin dispatcher.
pub struct Daemon {
    engine: Engine,
    _lock: InstanceLock,
}

impl Daemon {
    /// Load the config file, apply CLI overrides, acquire the instance
    /// lock, and construct the engine. Does not start serving yet.
    pub fn bootstrap(cli: &Cli) -> Result<Self> {
        let text = std::fs::read_to_string(&cli.config).map_err(|e| {
            CoreError::config(format!("cannot read config {}: {e}", cli.config.display()))
        })?;
        let (mut config, diagnostics) = Config::parse_named(&text, &cli.config.display().to_string())?;
        for diagnostic in &diagnostics {
            eprintln!("{diagnostic}");
        }
        if let Some(raw_port) = &cli.port {
            match raw_port.parse::<u16>() {
                Ok(port) => config.server.port = port,
                Err(_) => eprintln!(
                    "WARNING: ignoring invalid -p value '{raw_port}', using port {} from config",
                    config.server.port
                ),
            }
        }

        let lock = InstanceLock::acquire(&cli.config, &config.server.pidfile)?;
        info!(
            port = config.server.port,
            consoles = config.consoles.len(),
            "starting consoled"
        );

        let engine = Engine::new(&config, Box::new(SystemOpener), cli.truncate_logs)?;
        Ok(Self { engine, _lock: lock })
    }

    /// Run until a shutdown signal (`SIGTERM`) is observed.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let summary = self.engine.tick()?;
            if summary.accepted > 0 || summary.closed > 0 {
                info!(accepted = summary.accepted, closed = summary.closed, "tick");
            }
            if summary.shutdown_requested {
                info!("shutdown requested, exiting");
                return Ok(());
            }
        }
    }
}

/// Handle `-k`: signal a running instance and exit, without building an
/// engine of our own.
pub fn kill_running(config_path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(config_path).map_err(|e| {
        CoreError::config(format!("cannot read config {}: {e}", config_path.display()))
    })?;
    let config = Config::parse(&text)?;
    match crate::lock::kill_running(config_path, &config.server.pidfile) {
        Ok(()) => {
            info!(pidfile = %config.server.pidfile.display(), "sent SIGTERM");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "failed to signal running instance");
            Err(e)
        }
    }
}
