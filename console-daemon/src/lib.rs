//! # consoled
//!
//! The serial-console concentrator daemon binary's supporting modules:
//! CLI flags, structured logging setup, the single-instance lock, and the
//! bootstrap glue between a parsed config file and a running
//! [`console_core::engine::Engine`].
//!
//! The object graph and I/O engine themselves live in `console-core`;
//! this crate is the process-level shell around it.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bootstrap;
pub mod cli;
pub mod dev_tracing;
pub mod lock;
