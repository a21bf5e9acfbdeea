//! # Auth Module
//!
//! Resolves request credentials (bearer JWTs or none) to the database role
//! a statement runs as, and exposes the identity consumed by `auth.*()`
//! context functions.

pub mod errors;
pub mod jwt;
pub mod role;

pub use errors::{AuthError, AuthResult};
pub use jwt::{JwtClaims, JwtConfig, JwtManager, TokenRequest};
pub use role::{Credentials, Identity, Role, RoleCatalog, RoleResolver};
