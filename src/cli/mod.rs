//! Command-line interface for orbitforge.
//!
//! Provides the `run` command for fresh orbit-range runs and the
//! `resume` command for re-running only the jobs in a failed report.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
