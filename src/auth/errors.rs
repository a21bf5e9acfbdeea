//! # Auth Errors
//!
//! Error types raised while resolving request credentials to a role.

use thiserror::Error;

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Authentication errors
///
/// Every variant aborts the statement being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    // ==================
    // Credential Errors
    // ==================

    /// Authorization header is not a bearer credential
    #[error("Unsupported authorization scheme")]
    UnsupportedScheme,

    /// JWT token is malformed
    #[error("Malformed token")]
    MalformedToken,

    /// JWT token has expired
    #[error("Token expired")]
    TokenExpired,

    /// JWT signature is invalid
    #[error("Invalid token signature")]
    InvalidSignature,

    // ==================
    // Role Errors
    // ==================

    /// Token names a role the catalog does not know
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Role name is not a valid identifier
    #[error("Invalid role name: {0}")]
    InvalidRoleName(String),

    // ==================
    // Internal Errors
    // ==================

    /// Token generation failed
    #[error("Internal error: token generation failed")]
    TokenGenerationFailed,
}

impl AuthError {
    /// Returns the HTTP status code a gateway would map this error to
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            AuthError::UnsupportedScheme => 400,
            AuthError::MalformedToken => 400,
            AuthError::InvalidRoleName(_) => 400,

            // 401 Unauthorized
            AuthError::TokenExpired => 401,
            AuthError::InvalidSignature => 401,
            AuthError::UnknownRole(_) => 401,

            // 500 Internal Server Error
            AuthError::TokenGenerationFailed => 500,
        }
    }

    /// Returns whether this error is the caller's fault
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(AuthError::MalformedToken.status_code(), 400);
        assert_eq!(AuthError::TokenExpired.status_code(), 401);
        assert_eq!(AuthError::UnknownRole("x".into()).status_code(), 401);
        assert_eq!(AuthError::TokenGenerationFailed.status_code(), 500);
    }

    #[test]
    fn test_client_error_classification() {
        assert!(AuthError::InvalidSignature.is_client_error());
        assert!(!AuthError::TokenGenerationFailed.is_client_error());
    }
}
