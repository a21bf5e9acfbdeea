//! Static checks over a policy snapshot
//!
//! Warnings never block loading; they flag policy sets that are legal but
//! almost certainly not what the author meant.

use std::fmt;

use serde::Serialize;

use super::registry::PolicySnapshot;
use super::types::Policy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LintKind {
    /// A policy subquery reads the table the policy protects
    RecursiveTableReference,
    /// Policies exist but RLS is not enabled, so none are enforced
    PolicyOnDisabledTable,
    /// RLS is enabled with no policies: every non-bypass access is denied
    RlsEnabledNoPolicy,
    /// Restrictive policies with no permissive policy for some command
    RestrictiveOnly,
}

impl LintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LintKind::RecursiveTableReference => "recursive_table_reference",
            LintKind::PolicyOnDisabledTable => "policy_on_disabled_table",
            LintKind::RlsEnabledNoPolicy => "rls_enabled_no_policy",
            LintKind::RestrictiveOnly => "restrictive_only",
        }
    }
}

impl fmt::Display for LintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LintWarning {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    pub kind: LintKind,
    pub message: String,
}

impl fmt::Display for LintWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.policy {
            Some(policy) => write!(f, "{}.{}: {}", self.table, policy, self.message),
            None => write!(f, "{}: {}", self.table, self.message),
        }
    }
}

/// Lint every table and policy in `snapshot`, tables in name order
pub fn lint(snapshot: &PolicySnapshot) -> Vec<LintWarning> {
    let mut warnings = Vec::new();

    for state in snapshot.tables() {
        let policies: Vec<&Policy> = snapshot.policies_on(&state.table).collect();

        if state.enabled && policies.is_empty() {
            warnings.push(LintWarning {
                table: state.table.clone(),
                policy: None,
                kind: LintKind::RlsEnabledNoPolicy,
                message: "row level security is enabled but no policy exists; \
                          all access except bypass roles is denied"
                    .to_string(),
            });
        }
        if !state.enabled && !policies.is_empty() {
            warnings.push(LintWarning {
                table: state.table.clone(),
                policy: None,
                kind: LintKind::PolicyOnDisabledTable,
                message: format!(
                    "{} policies defined but row level security is disabled",
                    policies.len()
                ),
            });
        }

        for policy in &policies {
            if let Some(warning) = recursive_reference(policy) {
                warnings.push(warning);
            }
        }

        let restrictive_only = policies.iter().filter(|p| !p.permissive).any(|r| {
            !policies
                .iter()
                .any(|p| p.permissive && overlaps(p, r))
        });
        if state.enabled && restrictive_only {
            warnings.push(LintWarning {
                table: state.table.clone(),
                policy: None,
                kind: LintKind::RestrictiveOnly,
                message: "restrictive policies only narrow access; \
                          without a permissive policy nothing is granted"
                    .to_string(),
            });
        }
    }

    warnings
}

fn recursive_reference(policy: &Policy) -> Option<LintWarning> {
    let recursive = [policy.using.as_ref(), policy.with_check.as_ref()]
        .into_iter()
        .flatten()
        .any(|expr| expr.referenced_tables().contains(&policy.table));

    recursive.then(|| LintWarning {
        table: policy.table.clone(),
        policy: Some(policy.name.clone()),
        kind: LintKind::RecursiveTableReference,
        message: format!(
            "policy queries \"{}\" itself; move the lookup into a \
             security definer function to avoid infinite recursion",
            policy.table
        ),
    })
}

/// Whether a permissive policy could grant something the restrictive one narrows
fn overlaps(permissive: &Policy, restrictive: &Policy) -> bool {
    use super::types::Command;

    let commands = permissive.command == Command::All
        || restrictive.command == Command::All
        || permissive.command == restrictive.command;
    let roles = permissive.roles.is_empty()
        || restrictive.roles.is_empty()
        || restrictive.roles.iter().any(|r| permissive.applies_to_role(r));
    commands && roles
}
