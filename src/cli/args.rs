//! CLI argument definitions using clap
//!
//! Commands:
//! - rlsgate check --policies <path>
//! - rlsgate eval --policies <path> [--data <path>] < request.json
//! - rlsgate test --fixture <path> [--workers <n>]
//! - rlsgate token [--sub <id>] [--role <role>] [--email <email>] [--aal <level>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// rlsgate - Row-level security policy evaluator
#[derive(Parser, Debug)]
#[command(name = "rlsgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a policy set and report lint warnings
    Check {
        /// Policy set (.json or .sql)
        #[arg(long)]
        policies: PathBuf,
    },

    /// Evaluate one request read from stdin
    Eval {
        /// Policy set (.json or .sql)
        #[arg(long)]
        policies: PathBuf,

        /// Table data for policy subqueries (JSON object of table to rows)
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Run a policy test fixture
    Test {
        /// Fixture file
        #[arg(long)]
        fixture: PathBuf,

        /// Worker threads, overriding the configuration
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Mint a signed access token
    Token {
        #[arg(long)]
        sub: Option<String>,

        #[arg(long)]
        role: Option<String>,

        #[arg(long)]
        email: Option<String>,

        /// Authenticator assurance level (aal1, aal2)
        #[arg(long)]
        aal: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from([
            "rlsgate", "test", "--fixture", "todos.json", "--workers", "4", "--config", "rls.json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("rls.json")));
        assert!(matches!(cli.command, Command::Test { workers: Some(4), .. }));

        let cli = Cli::try_parse_from(["rlsgate", "token", "--sub", "u1", "--aal", "aal2"]).unwrap();
        assert!(cli.config.is_none());
        assert!(matches!(cli.command, Command::Token { sub: Some(_), role: None, .. }));

        assert!(Cli::try_parse_from(["rlsgate", "check"]).is_err());
    }
}
