//! CLI module for the converge tool.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting state.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
