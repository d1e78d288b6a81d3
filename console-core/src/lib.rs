//! Console Core
//!
//! Object graph and readiness-driven I/O engine for a serial-console
//! concentrator daemon: a process that holds open a set of serial devices
//! (or reset-program ptys) and lets many clients attach to watch, and at
//! most one at a time drive, each one.
//!
//! - Bounded ring buffer with overwrite semantics (`ring`)
//! - The typed endpoint model: Console / LogFile / ClientSocket (`object`)
//! - The arena that owns every object (`registry`)
//! - Attach/detach/close and the writer-steal protocol (`link`)
//! - The mio-based readiness loop tying it all together (`engine`)
//! - The client input control-byte parser (`control`)
//! - Transport abstraction so consoles/log files can be faked in tests (`opener`)
//! - The config file grammar (`config`)
//! - Error types (`error`)

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod link;
pub mod object;
pub mod opener;
pub mod reconnect;
pub mod registry;
pub mod ring;

pub mod prelude {
    pub use crate::config::{Config, ConsoleSpec, ServerDirectives};
    pub use crate::control::{ControlCommand, Parser as ControlParser};
    pub use crate::engine::{Engine, TickSummary};
    pub use crate::error::{CoreError, Result};
    pub use crate::object::{Object, ObjectId, ObjectKind};
    pub use crate::opener::{NullOpener, Opener, SystemOpener};
    pub use crate::registry::Registry;
    pub use crate::ring::{DrainOutcome, RingBuffer};
}
