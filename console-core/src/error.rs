//! Error types for the object graph and I/O engine.

use std::io;
use thiserror::Error;

/// The error kinds named in the daemon's error handling design: one
/// variant per failure mode, with `#[from] io::Error` for the common case
/// and constructor helpers for the rest.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed directive, unknown token, or unmatched quote in the
    /// config file.
    #[error("config error: {0}")]
    Config(String),

    /// A transport could not be attached (console dial/open/spawn failed).
    #[error("open failed for {name}: {reason}")]
    OpenFailed { name: String, reason: String },

    /// Operation attempted on a sink that has already seen EOF.
    #[error("{0} is closed")]
    Closed(String),

    /// A `(type, name)` pair already exists in the registry.
    #[error("duplicate object: {0}")]
    Duplicate(String),

    /// The wall clock could not be read.
    #[error("clock unreadable: {0}")]
    Clock(String),

    /// Non-recoverable I/O error (anything other than `EINTR`/`EAGAIN`/
    /// `EPIPE`, which the ring and engine handle internally).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Allocation failure; always fatal.
    #[error("out of memory")]
    OutOfMemory,
}

/// Result type alias used throughout `console-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    #[must_use]
    pub fn open_failed(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::OpenFailed {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Whether this is a transient I/O condition already handled inline
    /// (`EINTR`/`EAGAIN`/`EWOULDBLOCK`), as opposed to one that should be
    /// logged and propagated as fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => {
                matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
            }
            _ => false,
        }
    }

    /// Whether this error should abort the daemon entirely, as opposed to
    /// one a single directive or attach attempt can absorb.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::OutOfMemory) && !self.is_recoverable()
    }
}
