//! # Role Resolution
//!
//! Maps inbound credentials to exactly one database role.
//!
//! - No credentials resolve to `anon` and never fail
//! - A valid bearer token resolves to its `role` claim, `authenticated` by default
//! - Malformed, expired or badly signed tokens fail with an [`AuthError`]

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{AuthError, AuthResult};
use super::jwt::{JwtClaims, JwtManager};

pub const ANON: &str = "anon";
pub const AUTHENTICATED: &str = "authenticated";
pub const SERVICE_ROLE: &str = "service_role";
pub const POSTGRES: &str = "postgres";

/// A named identity class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,

    /// Whether the role skips row-level security entirely
    #[serde(default)]
    pub bypass_rls: bool,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bypass_rls: false,
        }
    }

    pub fn bypassing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bypass_rls: true,
        }
    }
}

/// Returns true if `name` is a plain SQL identifier
pub fn is_valid_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Regex> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,62}$").expect("static regex"))
        .is_match(name)
}

/// The fixed set of roles a request may resolve to
#[derive(Debug, Clone)]
pub struct RoleCatalog {
    roles: BTreeMap<String, Role>,
}

impl Default for RoleCatalog {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        for role in [
            Role::new(ANON),
            Role::new(AUTHENTICATED),
            Role::bypassing(SERVICE_ROLE),
            Role::bypassing(POSTGRES),
        ] {
            roles.insert(role.name.clone(), role);
        }
        Self { roles }
    }
}

impl RoleCatalog {
    /// Register a custom role, replacing any existing definition
    pub fn register(&mut self, role: Role) -> AuthResult<()> {
        if !is_valid_identifier(&role.name) {
            return Err(AuthError::InvalidRoleName(role.name));
        }
        self.roles.insert(role.name.clone(), role);
        Ok(())
    }

    pub fn with_role(mut self, role: Role) -> AuthResult<Self> {
        self.register(role)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub fn lookup(&self, name: &str) -> AuthResult<Role> {
        self.get(name)
            .cloned()
            .ok_or_else(|| AuthError::UnknownRole(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roles.keys().map(String::as_str)
    }
}

/// Credentials presented with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No credentials at all
    Anonymous,
    /// A bearer JWT
    Bearer(String),
}

impl Credentials {
    /// Parse an `Authorization` header value
    ///
    /// An absent or blank header is anonymous. Anything other than a
    /// `Bearer` scheme is rejected.
    pub fn from_header(header: Option<&str>) -> AuthResult<Self> {
        let header = match header.map(str::trim) {
            None | Some("") => return Ok(Credentials::Anonymous),
            Some(h) => h,
        };

        let (scheme, token) = header
            .split_once(char::is_whitespace)
            .ok_or(AuthError::MalformedToken)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::UnsupportedScheme);
        }

        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MalformedToken);
        }
        Ok(Credentials::Bearer(token.to_string()))
    }

    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            Some(t) if !t.trim().is_empty() => Credentials::Bearer(t.trim().to_string()),
            _ => Credentials::Anonymous,
        }
    }
}

/// The resolved identity of a request
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub role: Role,

    /// JWT claims, if the request carried or impersonated a token
    pub claims: Option<Value>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            role: Role::new(ANON),
            claims: None,
        }
    }

    pub fn can_bypass_rls(&self) -> bool {
        self.role.bypass_rls
    }

    /// `auth.uid()`: the `sub` claim
    pub fn uid(&self) -> Value {
        self.claim("sub")
    }

    /// `auth.email()`: the `email` claim
    pub fn email(&self) -> Value {
        self.claim("email")
    }

    /// `auth.role()`: the resolved role name
    pub fn role_name(&self) -> Value {
        Value::String(self.role.name.clone())
    }

    /// `auth.jwt()`: the full claims object
    pub fn jwt(&self) -> Value {
        self.claims.clone().unwrap_or(Value::Null)
    }

    fn claim(&self, key: &str) -> Value {
        self.claims
            .as_ref()
            .and_then(|c| c.get(key))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Resolves credentials to identities
#[derive(Debug, Clone)]
pub struct RoleResolver {
    jwt: JwtManager,
    catalog: RoleCatalog,
}

impl RoleResolver {
    pub fn new(jwt: JwtManager, catalog: RoleCatalog) -> Self {
        Self { jwt, catalog }
    }

    pub fn catalog(&self) -> &RoleCatalog {
        &self.catalog
    }

    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    /// Resolve credentials to exactly one role
    pub fn resolve(&self, credentials: &Credentials) -> AuthResult<Identity> {
        match credentials {
            Credentials::Anonymous => Ok(Identity {
                role: self.catalog.lookup(ANON)?,
                claims: None,
            }),
            Credentials::Bearer(token) => {
                let claims = self.jwt.validate_token(token)?;
                self.identity_from_claims(&claims)
            }
        }
    }

    /// Build an identity for a role without a token
    ///
    /// Used by fixtures and the `eval` command to simulate a request as a
    /// given role with hand-written claims.
    pub fn impersonate(&self, role: &str, claims: Option<Value>) -> AuthResult<Identity> {
        Ok(Identity {
            role: self.catalog.lookup(role)?,
            claims,
        })
    }

    fn identity_from_claims(&self, claims: &JwtClaims) -> AuthResult<Identity> {
        let role_name = claims.role.as_deref().unwrap_or(AUTHENTICATED);
        Ok(Identity {
            role: self.catalog.lookup(role_name)?,
            claims: Some(claims.to_json()),
        })
    }
}
