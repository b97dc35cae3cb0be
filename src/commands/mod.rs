//! CLI command implementations for herakles-log-exporter.
//!
//! This module provides implementations for all CLI subcommands:
//! - `check`: Program compilation check
//! - `config`: Configuration file generation
//! - `dump`: Syntax tree, type and bytecode listings
//! - `oneshot`: Read logs once and print metrics

pub mod check;
pub mod config;
pub mod dump;
pub mod oneshot;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
pub use dump::{command_dump, DumpKind};
pub use oneshot::command_oneshot;
