//! Structured logging setup.
//!
//! Verbosity is driven by `-v`/`-vv`/`-vvv` on top of whatever `RUST_LOG`
//! already asks for, so an operator can get more detail without having to
//! remember the env var syntax, while `RUST_LOG` still wins for anything
//! more specific (per-module filters, etc).

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `verbosity` is the `-v` count
/// from the CLI; 0 maps to `info`, 1 to `debug`, 2+ to `trace`, and is
/// only used as a fallback when `RUST_LOG` is unset.
pub fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
