//! Fixture files: a policy set, table data and expected outcomes

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{HarnessError, HarnessResult};
use crate::auth::RoleResolver;
use crate::engine::{Engine, EngineSettings};
use crate::eval::{MemoryTables, Row};
use crate::policy::{LoadReport, Operation, PolicyDef, PolicyRegistry, PolicySet, TableRls};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub tables: Vec<TableRls>,
    #[serde(default)]
    pub policies: Vec<PolicyDef>,
    #[serde(default)]
    pub sql: Option<String>,
    /// Rows readable by policy subqueries and `visible` cases
    #[serde(default)]
    pub data: MemoryTables,
    #[serde(default)]
    pub cases: Vec<Case>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub name: String,
    pub table: String,
    pub command: Operation,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub claims: Option<Value>,
    #[serde(default)]
    pub row: Option<Row>,
    #[serde(default)]
    pub proposed_row: Option<Row>,
    pub expect: Expectation,
}

/// Expected outcome of a case
///
/// Written as `"allow"`, `"deny"`, `"error"` or `{"visible": n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "ExpectationRepr")]
pub enum Expectation {
    Allow,
    Deny,
    Error,
    /// Number of `data` rows of the table visible to a `select`
    Visible(usize),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Keyword {
    Allow,
    Deny,
    Error,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpectationRepr {
    Keyword(Keyword),
    Visible { visible: usize },
}

impl From<ExpectationRepr> for Expectation {
    fn from(repr: ExpectationRepr) -> Self {
        match repr {
            ExpectationRepr::Keyword(Keyword::Allow) => Expectation::Allow,
            ExpectationRepr::Keyword(Keyword::Deny) => Expectation::Deny,
            ExpectationRepr::Keyword(Keyword::Error) => Expectation::Error,
            ExpectationRepr::Visible { visible } => Expectation::Visible(visible),
        }
    }
}

impl Serialize for Expectation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Expectation::Visible(n) => {
                serde_json::json!({ "visible": n }).serialize(serializer)
            }
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Allow => f.write_str("allow"),
            Expectation::Deny => f.write_str("deny"),
            Expectation::Error => f.write_str("error"),
            Expectation::Visible(n) => write!(f, "visible {}", n),
        }
    }
}

impl Fixture {
    pub fn from_json(text: &str) -> HarnessResult<Self> {
        let fixture: Fixture =
            serde_json::from_str(text).map_err(|e| HarnessError::Json(e.to_string()))?;
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| HarnessError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&content)
    }

    /// Structural checks that do not need the policy set
    pub fn validate(&self) -> HarnessResult<()> {
        let mut names = HashSet::new();
        for case in &self.cases {
            if !names.insert(case.name.as_str()) {
                return Err(HarnessError::invalid_case(&case.name, "duplicate case name"));
            }
            match case.expect {
                Expectation::Visible(_) => {
                    if case.command != Operation::Select {
                        return Err(HarnessError::invalid_case(
                            &case.name,
                            "visible expectations require command select",
                        ));
                    }
                }
                _ => {
                    if case.row.is_none() {
                        return Err(HarnessError::invalid_case(&case.name, "missing row"));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn policy_set(&self) -> PolicySet {
        PolicySet {
            tables: self.tables.clone(),
            policies: self.policies.clone(),
            sql: self.sql.clone(),
        }
    }

    /// Install the policy set into a fresh registry and build an engine over the data
    pub fn into_engine(
        self,
        resolver: RoleResolver,
        settings: EngineSettings,
    ) -> HarnessResult<(Engine, Vec<Case>, LoadReport)> {
        let registry = Arc::new(PolicyRegistry::new());
        let report = self.policy_set().install(&registry)?;
        let engine = Engine::new(resolver, registry, Arc::new(self.data)).with_settings(settings);
        Ok((engine, self.cases, report))
    }
}
