//! Command-line interface for recon3d.
//!
//! Provides commands for running the reconstruction pipeline, listing runs,
//! and tailing run logs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
