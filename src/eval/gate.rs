//! # Access Gate
//!
//! Decides whether a row access passes row-level security.
//!
//! 1. Bypass roles, tables without RLS, and non-forced owners are allowed
//! 2. No applicable permissive policy denies
//! 3. Otherwise at least one permissive policy and every restrictive policy
//!    must evaluate to true
//!
//! `update` additionally needs the row to be visible through `select`
//! policies, and every new row version must satisfy the check clause
//! (`with check`, falling back to `using`).

use std::fmt;

use serde::Serialize;
use tracing::{debug, trace};

use super::context::RequestContext;
use super::errors::{EvalResult, StatementError};
use super::evaluator::PredicateEvaluator;
use super::source::{Row, TableSource};
use crate::observability::Event;
use crate::policy::registry::PolicySnapshot;
use crate::policy::types::{Operation, Policy};

/// Which policy clause a decision was made on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Clause {
    Using,
    WithCheck,
}

impl Clause {
    fn of(self, policy: &Policy) -> Option<&crate::policy::expr::Expr> {
        match self {
            Clause::Using => policy.using_clause(),
            Clause::WithCheck => policy.check_clause(),
        }
    }
}

/// Why access was granted without or through policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Grant {
    BypassRole,
    RlsDisabled,
    TableOwner,
    Policies,
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::BypassRole => write!(f, "role bypasses row level security"),
            Grant::RlsDisabled => write!(f, "row level security is disabled for the table"),
            Grant::TableOwner => write!(f, "table owner is exempt from row level security"),
            Grant::Policies => write!(f, "policies passed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DenyReason {
    /// Default deny: nothing grants this (operation, role)
    NoPermissivePolicy { operation: Operation, clause: Clause },
    /// Permissive policies exist but none passed
    PermissiveFailed { operation: Operation, clause: Clause },
    /// A restrictive policy did not pass
    RestrictiveFailed {
        operation: Operation,
        clause: Clause,
        policy: String,
    },
}

impl DenyReason {
    pub fn clause(&self) -> Clause {
        match self {
            DenyReason::NoPermissivePolicy { clause, .. }
            | DenyReason::PermissiveFailed { clause, .. }
            | DenyReason::RestrictiveFailed { clause, .. } => *clause,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoPermissivePolicy { operation, .. } => {
                write!(f, "no permissive {} policy applies to the role", operation)
            }
            DenyReason::PermissiveFailed { operation, clause } => write!(
                f,
                "no permissive {} policy passed its {} clause",
                operation,
                clause_name(*clause)
            ),
            DenyReason::RestrictiveFailed {
                operation,
                clause,
                policy,
            } => write!(
                f,
                "restrictive {} policy \"{}\" failed its {} clause",
                operation,
                policy,
                clause_name(*clause)
            ),
        }
    }
}

fn clause_name(clause: Clause) -> &'static str {
    match clause {
        Clause::Using => "USING",
        Clause::WithCheck => "WITH CHECK",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Grant),
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    pub fn reason(&self) -> String {
        match self {
            Decision::Allow(grant) => grant.to_string(),
            Decision::Deny(reason) => reason.to_string(),
        }
    }
}

/// Result of an authorized write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Applied,
    /// Row not visible to the statement, silently left untouched
    Skipped,
}

pub struct AccessGate<'a> {
    snapshot: &'a PolicySnapshot,
    evaluator: PredicateEvaluator<'a>,
}

impl<'a> AccessGate<'a> {
    pub fn new(snapshot: &'a PolicySnapshot, source: &'a dyn TableSource) -> Self {
        Self {
            snapshot,
            evaluator: PredicateEvaluator::new(source),
        }
    }

    /// Decide a single row access
    ///
    /// For `insert`, `row` is the new row unless `proposed` is given. For
    /// `update`, `row` is the pre-image and `proposed` the new version
    /// (defaulting to the pre-image).
    pub fn evaluate(
        &self,
        table: &str,
        operation: Operation,
        row: &Row,
        proposed: Option<&Row>,
        ctx: &mut RequestContext,
    ) -> EvalResult<Decision> {
        if let Some(grant) = self.exemption(table, ctx) {
            trace!(
                event = Event::RlsBypassed.as_str(),
                table,
                role = ctx.role_name(),
                grant = ?grant,
            );
            return Ok(Decision::Allow(grant));
        }

        let new_row = proposed.unwrap_or(row);
        let steps: Vec<(Operation, Clause, &Row)> = match operation {
            Operation::Select => vec![(Operation::Select, Clause::Using, row)],
            Operation::Delete => vec![(Operation::Delete, Clause::Using, row)],
            Operation::Insert => vec![(Operation::Insert, Clause::WithCheck, new_row)],
            Operation::Update => vec![
                (Operation::Select, Clause::Using, row),
                (Operation::Update, Clause::Using, row),
                (Operation::Update, Clause::WithCheck, new_row),
            ],
        };

        for (step_operation, clause, target) in steps {
            if let Some(reason) = self.check(table, step_operation, clause, target, ctx)? {
                debug!(
                    event = Event::AccessDenied.as_str(),
                    table,
                    operation = %operation,
                    role = ctx.role_name(),
                    reason = %reason,
                );
                return Ok(Decision::Deny(reason));
            }
        }
        Ok(Decision::Allow(Grant::Policies))
    }

    /// Rows of a read that pass `select` policies, in input order
    ///
    /// Denied rows are omitted. Checks for cancellation between rows.
    pub fn filter_visible<'r>(
        &self,
        table: &str,
        rows: &'r [Row],
        ctx: &mut RequestContext,
    ) -> EvalResult<Vec<&'r Row>> {
        let mut visible = Vec::new();
        for row in rows {
            ctx.check_interrupt()?;
            if self
                .evaluate(table, Operation::Select, row, None, ctx)?
                .is_allowed()
            {
                visible.push(row);
            }
        }
        Ok(visible)
    }

    /// Authorize a write
    ///
    /// Rows the statement cannot see are skipped without error; a new row
    /// version failing its check clause rejects the statement.
    pub fn authorize_write(
        &self,
        table: &str,
        operation: Operation,
        row: &Row,
        proposed: Option<&Row>,
        ctx: &mut RequestContext,
    ) -> Result<WriteOutcome, StatementError> {
        if !operation.is_write() {
            return Err(super::errors::EvalError::invalid("select is not a write").into());
        }

        match self.evaluate(table, operation, row, proposed, ctx)? {
            Decision::Allow(_) => Ok(WriteOutcome::Applied),
            Decision::Deny(reason) if reason.clause() == Clause::Using => Ok(WriteOutcome::Skipped),
            Decision::Deny(_) => {
                debug!(
                    event = Event::WriteRejected.as_str(),
                    table,
                    operation = %operation,
                    role = ctx.role_name(),
                );
                Err(StatementError::WriteRejected {
                    table: table.to_string(),
                    operation,
                })
            }
        }
    }

    fn exemption(&self, table: &str, ctx: &RequestContext) -> Option<Grant> {
        if ctx.identity().can_bypass_rls() {
            return Some(Grant::BypassRole);
        }
        let state = self.snapshot.table_state(table);
        if !state.enabled {
            return Some(Grant::RlsDisabled);
        }
        if state.exempts(ctx.role_name()) {
            return Some(Grant::TableOwner);
        }
        None
    }

    /// `None` if the row passes, otherwise why it does not
    fn check(
        &self,
        table: &str,
        operation: Operation,
        clause: Clause,
        row: &Row,
        ctx: &mut RequestContext,
    ) -> EvalResult<Option<DenyReason>> {
        let applicable = self
            .snapshot
            .policies_for(table, operation, ctx.role_name());

        if applicable.permissive.is_empty() {
            return Ok(Some(DenyReason::NoPermissivePolicy { operation, clause }));
        }

        let mut permissive_ok = false;
        for policy in &applicable.permissive {
            if self.passes(policy, clause, row, ctx)? {
                permissive_ok = true;
                break;
            }
        }
        if !permissive_ok {
            return Ok(Some(DenyReason::PermissiveFailed { operation, clause }));
        }

        for policy in &applicable.restrictive {
            if !self.passes(policy, clause, row, ctx)? {
                return Ok(Some(DenyReason::RestrictiveFailed {
                    operation,
                    clause,
                    policy: policy.name.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn passes(
        &self,
        policy: &Policy,
        clause: Clause,
        row: &Row,
        ctx: &mut RequestContext,
    ) -> EvalResult<bool> {
        match clause.of(policy) {
            Some(expr) => self.evaluator.evaluate(expr, row, ctx),
            None => Ok(true),
        }
    }
}
