//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Converge - reconcile declared infrastructure with recorded state.
#[derive(Parser, Debug)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the desired-state document.
    #[arg(short, long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the desired-state document.
    Validate {
        /// Show warnings as well as errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the expanded resource graph in dependency order.
    Graph,

    /// Compute and display a plan.
    Plan {
        /// Save the plan to a file for a later `apply`.
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Plan the destruction of everything in state.
        #[arg(long)]
        destroy: bool,
    },

    /// Apply a saved plan, or plan and apply in one go.
    Apply {
        /// Saved plan file.
        plan: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum number of concurrently running steps.
        #[arg(short, long)]
        parallelism: Option<usize>,

        /// Stop starting new steps after the first failure.
        #[arg(long)]
        fail_fast: bool,
    },

    /// Destroy everything recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect and edit recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded addresses.
    List,

    /// Show one recorded entry.
    Show {
        /// Instance address.
        address: String,
    },

    /// Rename an entry without touching the object.
    Mv {
        /// Current address.
        from: String,
        /// New address.
        to: String,
    },

    /// Stop tracking an entry without destroying the object.
    Rm {
        /// Instance address.
        address: String,
    },

    /// Record an existing object at an address.
    Import {
        /// Instance address.
        address: String,

        /// Object attributes as a JSON object.
        #[arg(long, default_value = "{}")]
        attributes: String,
    },

    /// Mark an entry for replacement on the next apply.
    Taint {
        /// Instance address.
        address: String,
    },

    /// Clear the taint flag of an entry.
    Untaint {
        /// Instance address.
        address: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_with_overrides() {
        let cli = Cli::try_parse_from([
            "converge",
            "apply",
            "plan.json",
            "--yes",
            "--parallelism",
            "4",
            "--fail-fast",
        ])
        .unwrap();

        match cli.command {
            Commands::Apply {
                plan,
                yes,
                parallelism,
                fail_fast,
            } => {
                assert_eq!(plan, Some(PathBuf::from("plan.json")));
                assert!(yes);
                assert_eq!(parallelism, Some(4));
                assert!(fail_fast);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_state_import() {
        let cli = Cli::try_parse_from([
            "converge",
            "--output",
            "json",
            "state",
            "import",
            "null_vm.web[0]",
            "--attributes",
            r#"{"id":"i-1"}"#,
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Import { ref address, .. }
            } if address == "null_vm.web[0]"
        ));
    }

    #[test]
    fn test_plan_destroy_flag() {
        let cli = Cli::try_parse_from(["converge", "plan", "--destroy", "-o", "out.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Plan { destroy: true, out: Some(_) }
        ));
    }
}
