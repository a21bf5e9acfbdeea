//! CLI-specific error types
//!
//! Every CLI error carries a stable code printed with the message.

use std::fmt;
use std::io;

use crate::auth::AuthError;
use crate::eval::StatementError;
use crate::harness::HarnessError;
use crate::policy::PolicyError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (files, stdin/stdout)
    IoError,
    /// Policy set could not be parsed, validated or applied
    PolicyError,
    /// One or more fixture cases did not match their expectation
    TestFailed,
    /// Token could not be minted or verified
    AuthError,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "RLS_CLI_CONFIG_ERROR",
            Self::IoError => "RLS_CLI_IO_ERROR",
            Self::PolicyError => "RLS_CLI_POLICY_ERROR",
            Self::TestFailed => "RLS_CLI_TEST_FAILED",
            Self::AuthError => "RLS_CLI_AUTH_ERROR",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn policy_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::PolicyError, msg)
    }

    pub fn test_failed(failed: usize, total: usize) -> Self {
        Self::new(
            CliErrorCode::TestFailed,
            format!("{} of {} cases failed", failed, total),
        )
    }

    pub fn auth_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::AuthError, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<PolicyError> for CliError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::Io { .. } => Self::io_error(e.to_string()),
            other => Self::policy_error(other.to_string()),
        }
    }
}

impl From<AuthError> for CliError {
    fn from(e: AuthError) -> Self {
        Self::auth_error(e.to_string())
    }
}

impl From<StatementError> for CliError {
    fn from(e: StatementError) -> Self {
        match e {
            StatementError::Authentication(auth) => auth.into(),
            other => Self::policy_error(other.to_string()),
        }
    }
}

impl From<HarnessError> for CliError {
    fn from(e: HarnessError) -> Self {
        match e {
            HarnessError::Io { .. } | HarnessError::Json(_) => Self::io_error(e.to_string()),
            HarnessError::Policy(policy) => policy.into(),
            HarnessError::InvalidCase { .. } => Self::policy_error(e.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(CliError::test_failed(1, 3).to_string(), "RLS_CLI_TEST_FAILED: 1 of 3 cases failed");

        let err: CliError = PolicyError::invalid("bad").into();
        assert_eq!(err.code(), &CliErrorCode::PolicyError);

        let err: CliError = StatementError::Authentication(AuthError::TokenExpired).into();
        assert_eq!(err.code_str(), "RLS_CLI_AUTH_ERROR");
    }
}
