// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A reconciliation engine for declarative infrastructure.
//!
//! ## Overview
//!
//! Converge takes a document declaring the resources that should exist,
//! compares it with the recorded state of what was last created, and
//! drives the world toward the declaration:
//!
//! - Expand `count` and `for_each` declarations into addressed instances
//! - Derive dependencies from `${...}` references and `depends_on`
//! - Diff each instance against state into create, update, replace or destroy
//! - Execute the plan in parallel while respecting every dependency
//! - Run provisioners after creation and taint instances whose provisioners fail
//!
//! ## Architecture
//!
//! 1. **Graph**: [`graph::GraphBuilder`] turns the document into an acyclic
//!    graph of resource instances
//! 2. **State**: [`state::StateStore`] holds the recorded objects behind an
//!    exclusive run lock, persisted by a [`state::Backend`]
//! 3. **Planner**: [`planner::DiffEngine`] computes a [`planner::Plan`] and
//!    [`planner::PlanExecutor`] schedules its steps
//! 4. **Providers**: [`provider::Provider`] implementations perform the
//!    external calls, [`provider::ProvisionerRunner`] runs post-create commands
//! 5. **Reconciler**: [`reconciler::Reconciler`] wires one run together
//!
//! ## Modules
//!
//! - [`config`]: Document parsing and validation
//! - [`graph`]: Addresses, references and the resource graph
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`planner`]: Diff computation and plan execution
//! - [`provider`]: Provider and provisioner interfaces
//! - [`reconciler`]: Plan and apply orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! settings:
//!   parallelism: 4
//!
//! resources:
//!   - type: null_network
//!     name: main
//!     attributes:
//!       cidr: 10.0.0.0/16
//!
//!   - type: null_server
//!     name: web
//!     count: 2
//!     attributes:
//!       network: "${null_network.main.id}"
//!     lifecycle:
//!       create_before_destroy: true
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{AttributeHasher, DesiredDocument, DocumentParser, DocumentValidator};
pub use error::{ConvergeError, Result};
pub use graph::{Address, GraphBuilder, ResourceGraph};
pub use planner::{ApplyReport, DiffEngine, Plan, PlanExecutor};
pub use provider::{NullProvider, Provider, ProviderSet, ProvisionerRunner};
pub use reconciler::Reconciler;
pub use state::{Backend, LocalBackend, MemoryBackend, S3Backend, StateStore};
