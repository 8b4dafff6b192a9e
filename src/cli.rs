//! Command-line interface definitions.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keystone", version, about = "Strongly-consistent coordination service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a replica.
    Server {
        /// This replica's host:port endpoint (doubles as its identity).
        #[arg(long)]
        id: String,
        /// Comma-separated cluster member list; must include this replica.
        #[arg(long)]
        members: String,
        /// Root directory for durable state.
        #[arg(long, default_value = "/var/lib/keystone")]
        data_dir: PathBuf,
        /// Optional JSON configuration file; CLI flags override it.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the consensus position of every member.
    Status {
        #[arg(long)]
        members: String,
    },

    /// Write a key.
    Put {
        key: String,
        value: String,
        #[arg(long)]
        members: String,
        #[arg(long, default_value = "")]
        uuid: String,
    },

    /// Read a key through the leader.
    Get {
        key: String,
        #[arg(long)]
        members: String,
        #[arg(long, default_value = "")]
        uuid: String,
    },

    /// Delete a key.
    Del {
        key: String,
        #[arg(long)]
        members: String,
        #[arg(long, default_value = "")]
        uuid: String,
    },

    /// List keys in a range.
    Scan {
        start_key: String,
        #[arg(default_value = "")]
        end_key: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        members: String,
        #[arg(long, default_value = "")]
        uuid: String,
    },

    /// Create a user account.
    Register {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        members: String,
    },

    /// Log in and print the user's uuid.
    Login {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        members: String,
    },

    /// Ask one replica to drop its binlog prefix below an index.
    CleanBinlog {
        end_index: i64,
        /// The replica to clean.
        #[arg(long)]
        server: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
