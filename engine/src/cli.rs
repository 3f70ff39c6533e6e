//! CLI interface for Waypoint
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for running the step executor.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Waypoint step executor
///
/// Runs resumable agent operations one step at a time, scheduling each
/// continuation and pausing for human decisions.
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP server and the scheduler worker
    Serve,

    /// Create an operation
    Create {
        /// Operation ID
        #[arg(long)]
        operation_id: String,

        /// Owning user ID
        #[arg(long)]
        user: String,

        /// Opening user message
        #[arg(long)]
        message: String,

        /// Maximum number of steps
        #[arg(long)]
        max_steps: Option<u64>,

        /// Do not schedule the first step
        #[arg(long)]
        no_start: bool,
    },

    /// Show operation status
    Status {
        /// Operation ID
        operation_id: String,

        /// Include step history
        #[arg(long)]
        history: bool,

        /// Number of history entries to show
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Execute an operation in this process until it stops
    Run {
        /// Operation ID
        operation_id: String,

        /// Stop after this many steps
        #[arg(long)]
        max_steps: Option<u64>,
    },

    /// List operations waiting for a human decision
    Pending {
        /// Only show operations owned by this user
        #[arg(long)]
        user: Option<String>,
    },

    /// Cancel an operation
    Cancel {
        /// Operation ID
        operation_id: String,
    },

    /// Produce a scheduler signature header for a request body
    Sign {
        /// Hex ed25519 signing key seed
        #[arg(long)]
        key: String,

        /// File holding the body, or - for stdin
        #[arg(long, default_value = "-")]
        body: String,

        /// Unix timestamp to sign with (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },
}
