//! # Dumptruck Core
//!
//! Shared building blocks for the dumptruck workspace:
//! - [`config`]: the TOML job manifest (schedule, default args, task)
//! - [`error`]: the single error type every crate returns

pub mod config;
pub mod error;

pub use config::JobConfig;
pub use error::{DumptruckError, Result};
