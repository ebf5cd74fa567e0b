//! Command-line interface for repolens.
//!
//! Provides the `serve`, `worker` and `run` commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, PoolArg};
