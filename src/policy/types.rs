//! Policy and table RLS types

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{PolicyError, PolicyResult};
use super::expr::Expr;
use super::parser;
use crate::auth::role::is_valid_identifier;

/// Pseudo-role matching every role
pub const PUBLIC: &str = "public";

/// The command class a policy is declared for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl Command {
    pub fn applies_to(&self, operation: Operation) -> bool {
        match self {
            Command::All => true,
            Command::Select => operation == Operation::Select,
            Command::Insert => operation == Operation::Insert,
            Command::Update => operation == Operation::Update,
            Command::Delete => operation == Operation::Delete,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::All => "all",
            Command::Select => "select",
            Command::Insert => "insert",
            Command::Update => "update",
            Command::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Some(Command::All),
            "select" => Some(Command::Select),
            "insert" => Some(Command::Insert),
            "update" => Some(Command::Update),
            "delete" => Some(Command::Delete),
            _ => None,
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::All
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The statement kind being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Select)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row-level security policy attached to one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,
    pub table: String,
    pub command: Command,
    pub permissive: bool,

    /// Roles the policy applies to; empty or `public` means every role
    pub roles: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub using: Option<Expr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_check: Option<Expr>,
}

impl Policy {
    pub fn new(name: impl Into<String>, table: impl Into<String>, command: Command) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            command,
            permissive: true,
            roles: Vec::new(),
            using: None,
            with_check: None,
        }
    }

    pub fn restrictive(mut self) -> Self {
        self.permissive = false;
        self
    }

    pub fn to_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn using(mut self, expr: Expr) -> Self {
        self.using = Some(expr);
        self
    }

    pub fn with_check(mut self, expr: Expr) -> Self {
        self.with_check = Some(expr);
        self
    }

    pub fn applies_to_role(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r == role || r == PUBLIC)
    }

    /// Predicate deciding whether an existing row is visible or affected
    pub fn using_clause(&self) -> Option<&Expr> {
        self.using.as_ref()
    }

    /// Predicate a new row version must satisfy; defaults to `using`
    pub fn check_clause(&self) -> Option<&Expr> {
        self.with_check.as_ref().or(self.using.as_ref())
    }

    /// Reject clause combinations the command does not allow
    pub fn validate(&self) -> PolicyResult<()> {
        for ident in [&self.name, &self.table] {
            if ident.trim().is_empty() {
                return Err(PolicyError::InvalidIdentifier(ident.clone()));
            }
        }
        if !is_valid_identifier(&self.table) {
            return Err(PolicyError::InvalidIdentifier(self.table.clone()));
        }
        if let Some(role) = self.roles.iter().find(|r| !is_valid_identifier(r)) {
            return Err(PolicyError::InvalidIdentifier(role.clone()));
        }

        match self.command {
            Command::Select | Command::Delete if self.with_check.is_some() => {
                Err(PolicyError::invalid(format!(
                    "WITH CHECK cannot be applied to {} (policy \"{}\")",
                    self.command.as_str().to_uppercase(),
                    self.name
                )))
            }
            Command::Insert if self.using.is_some() => Err(PolicyError::invalid(format!(
                "only WITH CHECK expression allowed for INSERT (policy \"{}\")",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// An expression given either as SQL text or as a JSON tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprInput {
    Text(String),
    Tree(Expr),
}

impl ExprInput {
    pub fn resolve(&self, table: &str) -> PolicyResult<Expr> {
        match self {
            ExprInput::Text(text) => parser::parse_predicate(text, table),
            ExprInput::Tree(expr) => Ok(expr.clone()),
        }
    }
}

fn default_permissive() -> bool {
    true
}

/// Policy definition as written in policy set files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDef {
    #[serde(default)]
    pub name: Option<String>,
    pub table: String,
    #[serde(default)]
    pub command: Command,
    #[serde(default = "default_permissive")]
    pub permissive: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub using: Option<ExprInput>,
    #[serde(default)]
    pub with_check: Option<ExprInput>,
}

impl PolicyDef {
    /// Resolve into a [`Policy`], naming it `fallback_name` if unnamed
    pub fn into_policy(self, fallback_name: impl FnOnce() -> String) -> PolicyResult<Policy> {
        let using = self
            .using
            .as_ref()
            .map(|input| input.resolve(&self.table))
            .transpose()?;
        let with_check = self
            .with_check
            .as_ref()
            .map(|input| input.resolve(&self.table))
            .transpose()?;

        let policy = Policy {
            name: self.name.unwrap_or_else(fallback_name),
            table: self.table,
            command: self.command,
            permissive: self.permissive,
            roles: self.roles,
            using,
            with_check,
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// Per-table row-level security state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRls {
    pub table: String,

    pub enabled: bool,

    /// Apply policies to the table owner too
    #[serde(default)]
    pub force: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl TableRls {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            enabled: false,
            force: false,
            owner: None,
        }
    }

    pub fn enabled(table: impl Into<String>) -> Self {
        Self {
            enabled: true,
            ..Self::new(table)
        }
    }

    /// Whether a statement running as `role` skips policies on this table
    pub fn exempts(&self, role: &str) -> bool {
        if !self.enabled {
            return true;
        }
        !self.force && self.owner.as_deref() == Some(role)
    }
}
