//! Command-line interface for autoanalyst.
//!
//! Provides the `run` command, which drives one pipeline run, and the
//! `profile` command for inspecting what the planner will see.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
