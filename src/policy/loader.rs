//! Policy set loader
//!
//! Reads table RLS state and policies from disk and installs them into a
//! [`PolicyRegistry`] as one atomic batch.
//!
//! Two file formats:
//! - `.json`: a [`PolicySet`] object, optionally carrying inline SQL
//! - `.sql`: a script of `create policy` / `alter table` statements

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::errors::{PolicyError, PolicyResult};
use super::lint::{lint, LintWarning};
use super::parser::parse_script;
use super::registry::{PolicyRegistry, SchemaChange};
use super::types::{PolicyDef, TableRls};
use crate::observability::Event;

/// Tables, policies and SQL statements forming one policy set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub tables: Vec<TableRls>,

    #[serde(default)]
    pub policies: Vec<PolicyDef>,

    /// SQL statements applied after `tables` and `policies`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// Outcome of installing a policy set
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub version: u64,
    pub changes: usize,
    pub warnings: Vec<LintWarning>,
}

impl PolicySet {
    pub fn from_json(text: &str) -> PolicyResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_sql(text: impl Into<String>) -> Self {
        Self {
            sql: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.policies.is_empty()
            && self.sql.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    /// Resolve into schema changes, in application order
    ///
    /// Unnamed policies are named `<table>_<command>_<n>`, counting per
    /// table and command from 1.
    pub fn into_changes(self) -> PolicyResult<Vec<SchemaChange>> {
        let mut changes = Vec::new();

        for state in self.tables {
            changes.push(SchemaChange::SetRls {
                table: state.table.clone(),
                enabled: state.enabled,
            });
            if state.force {
                changes.push(SchemaChange::ForceRls {
                    table: state.table.clone(),
                    force: true,
                });
            }
            if let Some(owner) = state.owner {
                changes.push(SchemaChange::SetOwner {
                    table: state.table,
                    owner,
                });
            }
        }

        let mut unnamed: HashMap<(String, &'static str), usize> = HashMap::new();
        for def in self.policies {
            let key = (def.table.clone(), def.command.as_str());
            let policy = def.into_policy(|| {
                let n = unnamed.entry(key.clone()).or_insert(0);
                *n += 1;
                format!("{}_{}_{}", key.0, key.1, n)
            })?;
            changes.push(SchemaChange::CreatePolicy(policy));
        }

        if let Some(sql) = self.sql {
            changes.extend(parse_script(&sql)?);
        }

        Ok(changes)
    }

    /// Apply to `registry` as one batch, then lint the published snapshot
    pub fn install(self, registry: &PolicyRegistry) -> PolicyResult<LoadReport> {
        let changes = self.into_changes()?;
        let count = changes.len();
        let version = registry.apply_all(changes)?;

        let snapshot = registry.snapshot();
        let warnings = lint(&snapshot);
        for warning in &warnings {
            warn!(
                event = Event::LintWarning.as_str(),
                table = %warning.table,
                policy = warning.policy.as_deref().unwrap_or(""),
                kind = warning.kind.as_str(),
                "{}",
                warning.message
            );
        }

        info!(
            event = Event::PoliciesLoaded.as_str(),
            version,
            changes = count,
            policies = snapshot.policies().count(),
            warnings = warnings.len(),
        );

        Ok(LoadReport {
            version,
            changes: count,
            warnings,
        })
    }
}

/// Read a policy set from a `.json` or `.sql` file
pub fn load_policy_file(path: &Path) -> PolicyResult<PolicySet> {
    let content = fs::read_to_string(path).map_err(|e| PolicyError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("sql") => Ok(PolicySet::from_sql(content)),
        Some("json") => PolicySet::from_json(&content),
        _ => Err(PolicyError::Io {
            path: path.display().to_string(),
            message: "expected a .json or .sql file".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::types::Command;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_json_policy_set() {
        let set: PolicySet = serde_json::from_value(json!({
            "tables": [{"table": "todos", "enabled": true, "owner": "app"}],
            "policies": [
                {"table": "todos", "command": "select", "using": "auth.uid() = user_id"},
                {"table": "todos", "command": "select", "roles": ["anon"], "using": "is_public"},
                {"name": "mfa", "table": "todos", "permissive": false,
                 "using": "(auth.jwt() ->> 'aal') = 'aal2'"}
            ]
        }))
        .unwrap();

        let changes = set.into_changes().unwrap();
        assert_eq!(changes.len(), 5);
        assert!(matches!(&changes[1], SchemaChange::SetOwner { owner, .. } if owner == "app"));

        let names: Vec<_> = changes
            .iter()
            .filter_map(|c| match c {
                SchemaChange::CreatePolicy(p) => Some(p.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["todos_select_1", "todos_select_2", "mfa"]);
    }

    #[test]
    fn test_invalid_clause_combination_rejected() {
        let set: PolicySet = serde_json::from_value(json!({
            "policies": [{"table": "todos", "command": "insert", "using": "true"}]
        }))
        .unwrap();
        assert!(matches!(set.into_changes(), Err(PolicyError::InvalidPolicy(_))));
    }

    #[test]
    fn test_install_is_atomic() {
        let registry = PolicyRegistry::new();
        let set = PolicySet::from_sql(
            "create policy a on todos using (true);\n\
             create policy a on todos using (false);",
        );

        assert!(matches!(
            set.install(&registry),
            Err(PolicyError::DuplicatePolicy { .. })
        ));
        assert_eq!(registry.version(), 0);
        assert_eq!(registry.snapshot().policies().count(), 0);
    }

    #[test]
    fn test_load_sql_file() {
        let mut file = tempfile::Builder::new().suffix(".sql").tempfile().unwrap();
        writeln!(
            file,
            "-- todos\n\
             alter table todos enable row level security;\n\
             create policy \"Users read own\" on public.todos for select to authenticated\n\
               using ((select auth.uid()) = user_id);"
        )
        .unwrap();

        let registry = PolicyRegistry::new();
        let report = load_policy_file(file.path())
            .unwrap()
            .install(&registry)
            .unwrap();
        assert_eq!(report.version, 1);
        assert_eq!(report.changes, 2);
        assert!(report.warnings.is_empty());

        let snapshot = registry.snapshot();
        assert!(snapshot.rls_enabled("todos"));
        let policy = snapshot.policies().next().unwrap();
        assert_eq!(policy.name, "Users read own");
        assert_eq!(policy.command, Command::Select);
    }

    #[test]
    fn test_unknown_extension() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            load_policy_file(file.path()),
            Err(PolicyError::Io { .. })
        ));
    }
}
