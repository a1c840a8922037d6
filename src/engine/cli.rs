//! dbfed CLI Module
//! Command-line interface for operating a federation

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dbfed")]
#[command(version)]
#[command(about = "Sharded and replicated query federation over SQL links", long_about = None)]
pub struct Cli {
    /// Federation config file (defaults to ./federation.json, then ~/.dbfed/federation.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show configured links and compositions
    Status,

    /// Show which shards a key value or key range routes to
    Route {
        /// Sharded link name
        #[arg(short, long)]
        link: String,

        /// Logical table
        #[arg(short, long)]
        table: String,

        /// Exact sharding key value
        #[arg(long, conflicts_with_all = ["min", "max"])]
        value: Option<i64>,

        /// Lower bound of a key range (inclusive)
        #[arg(long)]
        min: Option<i64>,

        /// Upper bound of a key range (inclusive)
        #[arg(long)]
        max: Option<i64>,
    },

    /// Count rows of a table through a link
    Count {
        /// Link name (defaults to the configured default)
        #[arg(short, long)]
        link: Option<String>,

        #[arg(short, long)]
        table: String,
    },

    /// Rebuild a table on every mirror of a replicated link
    Sync {
        /// Replicated link name
        #[arg(short, long)]
        link: String,

        #[arg(short, long)]
        table: String,

        /// Recreate the table without copying rows
        #[arg(long)]
        schema_only: bool,
    },

    /// Drop a stuck resync lock
    Unlock {
        /// Composition link name
        #[arg(short, long)]
        link: String,

        /// Table whose lock to drop
        #[arg(short, long, required_unless_present = "all")]
        table: Option<String>,

        /// Drop every lock of the link
        #[arg(long)]
        all: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        let cli = Cli::parse_from([
            "dbfed", "--format", "json", "route", "--link", "users", "--table", "users", "--min",
            "10", "--max", "20",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Route { link, min, max, value, .. } => {
                assert_eq!(link, "users");
                assert_eq!((min, max, value), (Some(10), Some(20), None));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_value_conflicts_with_range() {
        let parsed = Cli::try_parse_from([
            "dbfed", "route", "-l", "u", "-t", "u", "--value", "1", "--min", "0",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_unlock_needs_table_or_all() {
        assert!(Cli::try_parse_from(["dbfed", "unlock", "-l", "r"]).is_err());
        assert!(Cli::try_parse_from(["dbfed", "unlock", "-l", "r", "--all"]).is_ok());
    }
}
