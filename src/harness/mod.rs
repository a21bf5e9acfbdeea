//! Batch policy testing
//!
//! A fixture bundles a policy set, table data and cases with expected
//! outcomes (`allow`, `deny`, `error`, or a visible row count). The runner
//! evaluates every case as its own statement and reports mismatches.

mod fixture;
mod runner;

pub use fixture::{Case, Expectation, Fixture};
pub use runner::{CaseResult, FixtureReport, FixtureRunner, Observed};

use thiserror::Error;

use crate::policy::PolicyError;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Failed to read fixture {path}: {message}")]
    Io { path: String, message: String },

    #[error("Invalid fixture JSON: {0}")]
    Json(String),

    #[error("Invalid case \"{case}\": {message}")]
    InvalidCase { case: String, message: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl HarnessError {
    pub fn invalid_case(case: &str, message: impl Into<String>) -> Self {
        HarnessError::InvalidCase {
            case: case.to_string(),
            message: message.into(),
        }
    }
}
