//! Command-line interface for sciforge.
//!
//! Provides commands to run pipeline plans, print a starter plan and dump
//! the exported metrics.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
