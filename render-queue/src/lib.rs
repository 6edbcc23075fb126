//! render-queue library crate.
//!
//! Priority render queue for AI-assisted video editing. This module exposes
//! the queue service and its building blocks for the binary and for
//! integration testing.

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod queue;

pub use error::{Error, ErrorKind, ProcessError, Result};
