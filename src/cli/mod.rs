//! CLI module for rlsgate
//!
//! Provides command-line interface for:
//! - check: Load and lint a policy set
//! - eval: Evaluate one request against a policy set
//! - test: Run a policy test fixture
//! - token: Mint an access token

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check, check_to, eval, run, run_command, run_fixture, run_fixture_to, token};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_request, write_error, write_error_to, write_response, write_response_to};
