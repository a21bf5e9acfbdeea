//! Evaluation and statement errors
//!
//! A denied row is never an error. These abort the whole statement.

use thiserror::Error;

use crate::auth::AuthError;
use crate::policy::types::Operation;

/// Result type for predicate evaluation
pub type EvalResult<T> = Result<T, EvalError>;

/// Policy evaluation errors
///
/// Raised when a predicate cannot be evaluated. Surfaced instead of being
/// treated as a deny so misconfigured policies are not masked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Predicate references a column the row does not have
    #[error("column \"{column}\" does not exist")]
    UnknownColumn { column: String },

    /// Subquery reads a table with no data source
    #[error("relation \"{table}\" does not exist")]
    UnknownTable { table: String },

    /// Operands of incompatible types
    #[error("operator does not exist: {left} {op} {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    /// Non-boolean value used as a condition
    #[error("argument of {context} must be type boolean, not type {found}")]
    NotBoolean { context: String, found: String },

    /// Statement cancelled by the caller
    #[error("canceling statement due to user request")]
    Cancelled,

    /// Statement exceeded its deadline
    #[error("canceling statement due to statement timeout")]
    StatementTimeout,

    /// Request shape not usable for evaluation
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EvalError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EvalError::InvalidRequest(message.into())
    }

    /// Returns true for cancellation and timeout
    pub fn is_interrupt(&self) -> bool {
        matches!(self, EvalError::Cancelled | EvalError::StatementTimeout)
    }
}

/// Errors that abort a statement
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("policy evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    /// A new row version failed a WITH CHECK clause
    #[error("new row violates row-level security policy for table \"{table}\"")]
    WriteRejected { table: String, operation: Operation },
}

impl StatementError {
    /// Stable code used in CLI and fixture reports
    pub fn code(&self) -> &'static str {
        match self {
            StatementError::Authentication(_) => "RLS_AUTHENTICATION_ERROR",
            StatementError::Evaluation(_) => "RLS_POLICY_EVALUATION_ERROR",
            StatementError::WriteRejected { .. } => "RLS_WRITE_REJECTED",
        }
    }
}
