//! # Policy Registry
//!
//! Versioned, copy-on-write store of table RLS state and policies.
//!
//! ## Invariants
//! - Readers hold an `Arc<PolicySnapshot>` and never observe a partially
//!   applied batch of schema changes
//! - Writers are serialized by the registry lock; every applied batch bumps
//!   the snapshot version by one
//! - Policy order within a table is by name, so evaluation is reproducible

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::errors::{PolicyError, PolicyResult};
use super::types::{Operation, Policy, TableRls};
use crate::observability::Event;

/// A DDL-level change to the policy set
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    CreatePolicy(Policy),
    DropPolicy { table: String, name: String },
    SetRls { table: String, enabled: bool },
    ForceRls { table: String, force: bool },
    SetOwner { table: String, owner: String },
}

impl SchemaChange {
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreatePolicy(policy) => &policy.table,
            SchemaChange::DropPolicy { table, .. }
            | SchemaChange::SetRls { table, .. }
            | SchemaChange::ForceRls { table, .. }
            | SchemaChange::SetOwner { table, .. } => table,
        }
    }
}

/// Policies applicable to one (table, operation, role), split by kind
#[derive(Debug, Default)]
pub struct ApplicablePolicies<'a> {
    pub permissive: Vec<&'a Policy>,
    pub restrictive: Vec<&'a Policy>,
}

impl ApplicablePolicies<'_> {
    pub fn is_empty(&self) -> bool {
        self.permissive.is_empty() && self.restrictive.is_empty()
    }
}

/// An immutable view of every table's RLS state and policies
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicySnapshot {
    #[serde(skip)]
    version: u64,
    tables: BTreeMap<String, TableRls>,
    policies: BTreeMap<String, BTreeMap<String, Policy>>,
}

impl PolicySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn table(&self, name: &str) -> Option<&TableRls> {
        self.tables.get(name)
    }

    /// RLS state of a table; unknown tables have RLS disabled
    pub fn table_state(&self, name: &str) -> TableRls {
        self.tables
            .get(name)
            .cloned()
            .unwrap_or_else(|| TableRls::new(name))
    }

    pub fn rls_enabled(&self, name: &str) -> bool {
        self.tables.get(name).is_some_and(|t| t.enabled)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableRls> {
        self.tables.values()
    }

    /// Every policy, ordered by table then name
    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values().flat_map(BTreeMap::values)
    }

    pub fn policies_on<'a>(&'a self, table: &str) -> impl Iterator<Item = &'a Policy> + 'a {
        self.policies
            .get(table)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    /// Policies on `table` covering `operation` for `role`
    pub fn policies_for(&self, table: &str, operation: Operation, role: &str) -> ApplicablePolicies<'_> {
        let mut applicable = ApplicablePolicies::default();
        for policy in self.policies_on(table) {
            if !policy.command.applies_to(operation) || !policy.applies_to_role(role) {
                continue;
            }
            if policy.permissive {
                applicable.permissive.push(policy);
            } else {
                applicable.restrictive.push(policy);
            }
        }
        applicable
    }

    /// SHA-256 over the canonical JSON form of tables and policies
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&bytes))
    }

    fn table_mut(&mut self, table: &str) -> &mut TableRls {
        self.tables
            .entry(table.to_string())
            .or_insert_with(|| TableRls::new(table))
    }

    fn apply(&mut self, change: SchemaChange) -> PolicyResult<()> {
        match change {
            SchemaChange::CreatePolicy(policy) => {
                policy.validate()?;
                self.table_mut(&policy.table);
                let table = self.policies.entry(policy.table.clone()).or_default();
                if table.contains_key(&policy.name) {
                    return Err(PolicyError::DuplicatePolicy {
                        table: policy.table,
                        name: policy.name,
                    });
                }
                debug!(
                    event = Event::PolicyCreated.as_str(),
                    table = %policy.table,
                    policy = %policy.name,
                    command = %policy.command,
                    permissive = policy.permissive,
                );
                table.insert(policy.name.clone(), policy);
            }
            SchemaChange::DropPolicy { table, name } => {
                let removed = self
                    .policies
                    .get_mut(&table)
                    .and_then(|policies| policies.remove(&name));
                if removed.is_none() {
                    return Err(PolicyError::UnknownPolicy { table, name });
                }
                debug!(event = Event::PolicyDropped.as_str(), table = %table, policy = %name);
            }
            SchemaChange::SetRls { table, enabled } => {
                self.table_mut(&table).enabled = enabled;
                debug!(event = Event::RlsToggled.as_str(), table = %table, enabled);
            }
            SchemaChange::ForceRls { table, force } => {
                self.table_mut(&table).force = force;
                debug!(event = Event::RlsToggled.as_str(), table = %table, force);
            }
            SchemaChange::SetOwner { table, owner } => {
                self.table_mut(&table).owner = Some(owner);
            }
        }
        Ok(())
    }
}

/// Shared, read-mostly registry handing out snapshots
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the current snapshot
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    pub fn apply(&self, change: SchemaChange) -> PolicyResult<u64> {
        self.apply_all([change])
    }

    /// Apply a batch atomically
    ///
    /// On error nothing is published and the previous snapshot stays current.
    pub fn apply_all<I>(&self, changes: I) -> PolicyResult<u64>
    where
        I: IntoIterator<Item = SchemaChange>,
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = PolicySnapshot::clone(&guard);

        let mut applied = 0usize;
        for change in changes {
            next.apply(change)?;
            applied += 1;
        }

        next.version = guard.version + 1;
        let version = next.version;
        *guard = Arc::new(next);

        info!(
            event = Event::SnapshotPublished.as_str(),
            version,
            changes = applied,
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::expr::Expr;
    use crate::policy::types::Command;

    fn create(policy: Policy) -> SchemaChange {
        SchemaChange::CreatePolicy(policy)
    }

    #[test]
    fn test_policies_for_filters_by_command_and_role() {
        let registry = PolicyRegistry::new();
        registry
            .apply_all([
                SchemaChange::SetRls {
                    table: "todos".to_string(),
                    enabled: true,
                },
                create(Policy::new("b_read", "todos", Command::Select).to_roles(["authenticated"])),
                create(Policy::new("a_all", "todos", Command::All)),
                create(Policy::new("mfa", "todos", Command::All).restrictive()),
                create(Policy::new("anon_read", "todos", Command::Select).to_roles(["anon"])),
                create(Policy::new("writes", "todos", Command::Insert)),
            ])
            .unwrap();

        let snapshot = registry.snapshot();
        let applicable = snapshot.policies_for("todos", Operation::Select, "authenticated");
        let names: Vec<_> = applicable.permissive.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a_all", "b_read"]);
        assert_eq!(applicable.restrictive.len(), 1);

        let none = snapshot.policies_for("other", Operation::Select, "authenticated");
        assert!(none.is_empty());
    }

    #[test]
    fn test_versions_bump_per_batch() {
        let registry = PolicyRegistry::new();
        assert_eq!(registry.version(), 0);

        let v = registry
            .apply(SchemaChange::SetRls {
                table: "t".to_string(),
                enabled: true,
            })
            .unwrap();
        assert_eq!(v, 1);
        assert!(registry.snapshot().rls_enabled("t"));
    }

    #[test]
    fn test_failed_batch_publishes_nothing() {
        let registry = PolicyRegistry::new();
        registry
            .apply(create(Policy::new("p", "t", Command::Select)))
            .unwrap();
        let before = registry.snapshot();

        let result = registry.apply_all([
            SchemaChange::SetRls {
                table: "t".to_string(),
                enabled: true,
            },
            create(Policy::new("p", "t", Command::Select)),
        ]);

        assert!(matches!(result, Err(PolicyError::DuplicatePolicy { .. })));
        let after = registry.snapshot();
        assert_eq!(after.version(), before.version());
        assert!(!after.rls_enabled("t"));
    }

    #[test]
    fn test_pinned_snapshot_is_unaffected_by_writes() {
        let registry = PolicyRegistry::new();
        let pinned = registry.snapshot();

        registry
            .apply(create(
                Policy::new("p", "t", Command::Select).using(Expr::lit(true)),
            ))
            .unwrap();

        assert_eq!(pinned.policies().count(), 0);
        assert_eq!(registry.snapshot().policies().count(), 1);
    }

    #[test]
    fn test_drop_unknown_policy() {
        let registry = PolicyRegistry::new();
        let result = registry.apply(SchemaChange::DropPolicy {
            table: "t".to_string(),
            name: "missing".to_string(),
        });
        assert!(matches!(result, Err(PolicyError::UnknownPolicy { .. })));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = PolicyRegistry::new();
        let b = PolicyRegistry::new();
        assert_eq!(a.snapshot().fingerprint(), b.snapshot().fingerprint());

        a.apply(create(Policy::new("p", "t", Command::Select))).unwrap();
        assert_ne!(a.snapshot().fingerprint(), b.snapshot().fingerprint());
        assert_eq!(a.snapshot().fingerprint().len(), 64);
    }
}
