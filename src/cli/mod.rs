//! Command-line interface for swe-bench-harness.
//!
//! Provides commands for building environment images, provisioning sandboxes,
//! inspecting generated scripts and scoring patches.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
