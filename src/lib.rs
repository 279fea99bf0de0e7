//! git-split library crate
//!
//! Exposes the pipeline pieces so integration tests and benchmarks can drive
//! them without going through the CLI.

pub mod config;
pub mod credentials;
pub mod diff;
pub mod executor;
pub mod git_ops;
pub mod llm;
pub mod logging;
pub mod plan;
pub mod rotation;
pub mod util;
pub mod verify;
pub mod workflow;
