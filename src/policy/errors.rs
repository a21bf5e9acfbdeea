//! Policy definition and registry errors
//!
//! These are raised while parsing, loading, or applying schema changes.
//! Evaluation-time failures live in `eval::errors`.

use thiserror::Error;

/// Result type for policy operations
pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Predicate or policy text could not be parsed
    #[error("Parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    /// A policy with the same name already exists on the table
    #[error("Policy \"{name}\" for table \"{table}\" already exists")]
    DuplicatePolicy { table: String, name: String },

    /// Drop of a policy that does not exist
    #[error("Policy \"{name}\" for table \"{table}\" does not exist")]
    UnknownPolicy { table: String, name: String },

    /// Clause combination not allowed for the policy's command
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Table, role or policy name is not a valid identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Policy file could not be read
    #[error("Failed to read policy file {path}: {message}")]
    Io { path: String, message: String },

    /// Policy file is not valid JSON for the policy set format
    #[error("Invalid policy set JSON: {0}")]
    Json(String),
}

impl PolicyError {
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        PolicyError::Parse {
            position,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PolicyError::InvalidPolicy(message.into())
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(e: serde_json::Error) -> Self {
        PolicyError::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = PolicyError::DuplicatePolicy {
            table: "todos".to_string(),
            name: "owner".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Policy \"owner\" for table \"todos\" already exists"
        );

        let err = PolicyError::parse(4, "expected ')'");
        assert!(err.to_string().contains("offset 4"));
    }
}
