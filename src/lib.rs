#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod cli_agent;
pub mod config;
pub mod daemon;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod orchestrator;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::CoreError;

/// Job inspection subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobCommands {
    /// List jobs of an organization
    List {
        #[arg(long)]
        org: String,
    },
    /// List jobs that have gone idle
    Idle {
        #[arg(long)]
        org: String,
        /// Idle threshold in minutes (default: `[jobs] idle_minutes`)
        #[arg(long)]
        minutes: Option<u32>,
    },
    /// Delete a job with its processed messages
    Delete {
        #[arg(long)]
        org: String,
        #[arg(long)]
        job: String,
    },
}

/// Agent inspection subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentCommands {
    /// List registered agents of an organization
    List {
        #[arg(long)]
        org: String,
    },
    /// List agents with no assignment
    Available {
        #[arg(long)]
        org: String,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the JSON Schema of `config.toml`
    Schema,
    /// Print the effective configuration as TOML
    Show,
}
