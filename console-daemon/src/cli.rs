//! Command-line flags.

use std::path::PathBuf;

use clap::Parser;

/// A serial-console concentrator: holds consoles open and lets many
/// clients watch (and one at a time drive) each one.
///
/// `-V`/`--version` prints `"<package>-<version>"` (§6) rather than
/// clap's default `name version` layout.
#[derive(Parser, Debug)]
#[command(
    name = "consoled",
    version = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION")),
    about
)]
pub struct Cli {
    /// Path to the config file.
    #[arg(short = 'c', long = "config", default_value = "/etc/consoled.conf")]
    pub config: PathBuf,

    /// Override the server's listen port from the config file. Left as a
    /// raw string rather than `u16` so an invalid value becomes a
    /// `WARNING:` that falls back to the config file's port (§6), instead
    /// of a `clap` usage error that exits the process before `main` runs.
    #[arg(short = 'p', long = "port")]
    pub port: Option<String>,

    /// Send SIGTERM to the running daemon (found via its pidfile) and exit.
    #[arg(short = 'k', long = "kill")]
    pub kill: bool,

    /// Truncate every console's log file instead of appending to it.
    #[arg(short = 'z', long = "truncate-logs")]
    pub truncate_logs: bool,

    /// Increase log verbosity; repeatable (`-v`, `-vv`, `-vvv`).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Run in the foreground instead of daemonizing.
    #[arg(short = 'F', long = "foreground")]
    pub foreground: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_with_no_args() {
        let cli = Cli::parse_from(["consoled"]);
        assert_eq!(cli.config, PathBuf::from("/etc/consoled.conf"));
        assert!(!cli.kill);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn repeated_v_increments_verbosity() {
        let cli = Cli::parse_from(["consoled", "-vvv"]);
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn kill_and_port_flags_parse() {
        let cli = Cli::parse_from(["consoled", "-k", "-p", "4201"]);
        assert!(cli.kill);
        assert_eq!(cli.port.as_deref(), Some("4201"));
    }
}
