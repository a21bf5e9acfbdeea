//! # Engine
//!
//! Wires role resolution, the policy registry and the access gate.
//!
//! Each [`Statement`] pins one registry snapshot and owns one request
//! context, so policy changes published mid-statement are not observed and
//! memoized values never leak between statements.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::role::ANON;
use crate::auth::{AuthResult, Credentials, Identity, RoleResolver};
use crate::eval::{
    AccessGate, CacheStats, CancellationFlag, Decision, EvalError, EvalResult, RequestContext, Row,
    StatementError, StatementStats, TableSource, WriteOutcome,
};
use crate::observability::Event;
use crate::policy::{Operation, PolicyRegistry, PolicySnapshot};

/// Per-statement knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub statement_timeout: Option<Duration>,
    pub session_cache: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            statement_timeout: None,
            session_cache: true,
        }
    }
}

pub struct Engine {
    registry: Arc<PolicyRegistry>,
    resolver: RoleResolver,
    source: Arc<dyn TableSource>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        resolver: RoleResolver,
        registry: Arc<PolicyRegistry>,
        source: Arc<dyn TableSource>,
    ) -> Self {
        Self {
            registry,
            resolver,
            source,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &RoleResolver {
        &self.resolver
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Resolve credentials and start a statement
    pub fn begin(&self, credentials: &Credentials) -> Result<Statement<'_>, StatementError> {
        let identity = self.resolver.resolve(credentials)?;
        Ok(self.begin_as(identity))
    }

    /// Start a statement for an already resolved identity
    pub fn begin_as(&self, identity: Identity) -> Statement<'_> {
        let mut ctx =
            RequestContext::new(identity).with_cache_enabled(self.settings.session_cache);
        if let Some(timeout) = self.settings.statement_timeout {
            ctx = ctx.with_timeout(timeout);
        }
        let snapshot = self.registry.snapshot();

        debug!(
            event = Event::StatementBegin.as_str(),
            statement_id = %ctx.statement_id(),
            role = ctx.role_name(),
            snapshot_version = snapshot.version(),
        );

        Statement {
            source: self.source.as_ref(),
            snapshot,
            ctx,
        }
    }

    /// Identity for a request: a token wins over a role name; neither is `anon`
    pub fn identify(
        &self,
        token: Option<&str>,
        role: Option<&str>,
        claims: Option<Value>,
    ) -> AuthResult<Identity> {
        match (token, role) {
            (Some(token), _) => self.resolver.resolve(&Credentials::from_token(Some(token))),
            (None, role) => self.resolver.impersonate(role.unwrap_or(ANON), claims),
        }
    }

    /// Evaluate one request as its own statement
    pub fn evaluate_request(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationReport, StatementError> {
        let identity = self.identify(
            request.token.as_deref(),
            request.role.as_deref(),
            request.claims.clone(),
        )?;

        let mut statement = self.begin_as(identity);
        let decision = statement.evaluate(
            &request.table,
            request.command,
            &request.row,
            request.proposed_row.as_ref(),
        )?;
        let snapshot_version = statement.snapshot_version();
        let stats = statement.finish();

        Ok(EvaluationReport {
            allowed: decision.is_allowed(),
            reason: Some(decision.reason()),
            role: stats.role,
            statement_id: stats.statement_id,
            snapshot_version,
            cache: stats.cache,
        })
    }
}

/// One statement against a pinned snapshot
pub struct Statement<'e> {
    source: &'e dyn TableSource,
    snapshot: Arc<PolicySnapshot>,
    ctx: RequestContext,
}

impl Statement<'_> {
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn identity(&self) -> &Identity {
        self.ctx.identity()
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.ctx.cancellation()
    }

    /// Use `flag` to cancel this statement
    pub fn attach_cancellation(&mut self, flag: CancellationFlag) {
        self.ctx.set_cancellation(flag);
    }

    pub fn evaluate(
        &mut self,
        table: &str,
        operation: Operation,
        row: &Row,
        proposed: Option<&Row>,
    ) -> EvalResult<Decision> {
        self.ctx.check_interrupt().map_err(|e| self.interrupted(e))?;
        let gate = AccessGate::new(&self.snapshot, self.source);
        gate.evaluate(table, operation, row, proposed, &mut self.ctx)
            .map_err(|e| self.failed(table, e))
    }

    /// Rows of `table` visible to this statement
    pub fn select(&mut self, table: &str) -> EvalResult<Vec<Row>> {
        let source = self.source;
        let rows = source.rows(table).ok_or_else(|| EvalError::UnknownTable {
            table: table.to_string(),
        })?;
        let visible = self.filter(table, rows)?;
        Ok(visible.into_iter().cloned().collect())
    }

    /// Subset of `rows` visible to this statement, in input order
    pub fn filter<'r>(&mut self, table: &str, rows: &'r [Row]) -> EvalResult<Vec<&'r Row>> {
        let gate = AccessGate::new(&self.snapshot, self.source);
        gate.filter_visible(table, rows, &mut self.ctx)
            .map_err(|e| self.failed(table, e))
    }

    pub fn write(
        &mut self,
        table: &str,
        operation: Operation,
        row: &Row,
        proposed: Option<&Row>,
    ) -> Result<WriteOutcome, StatementError> {
        self.ctx.check_interrupt().map_err(|e| self.interrupted(e))?;
        let gate = AccessGate::new(&self.snapshot, self.source);
        gate.authorize_write(table, operation, row, proposed, &mut self.ctx)
            .map_err(|e| match e {
                StatementError::Evaluation(e) => StatementError::Evaluation(self.failed(table, e)),
                other => other,
            })
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.ctx.cache().stats()
    }

    pub fn finish(self) -> StatementStats {
        let stats = self.ctx.finish();
        debug!(
            event = Event::StatementComplete.as_str(),
            statement_id = %stats.statement_id,
            role = %stats.role,
            cache_hits = stats.cache.hits,
            cache_misses = stats.cache.misses,
            elapsed_micros = stats.elapsed_micros as u64,
        );
        stats
    }

    fn interrupted(&self, error: EvalError) -> EvalError {
        warn!(
            event = Event::StatementCancelled.as_str(),
            statement_id = %self.ctx.statement_id(),
            error = %error,
        );
        error
    }

    fn failed(&self, table: &str, error: EvalError) -> EvalError {
        if error.is_interrupt() {
            return self.interrupted(error);
        }
        warn!(
            event = Event::EvaluationFailed.as_str(),
            statement_id = %self.ctx.statement_id(),
            table,
            error = %error,
        );
        error
    }
}

/// Single evaluation request, as read by the `eval` command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub table: String,
    pub command: Operation,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub claims: Option<Value>,
    #[serde(default)]
    pub row: Row,
    #[serde(default)]
    pub proposed_row: Option<Row>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationReport {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub role: String,
    pub statement_id: Uuid,
    pub snapshot_version: u64,
    pub cache: CacheStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtConfig, JwtManager, RoleCatalog, TokenRequest};
    use crate::eval::MemoryTables;
    use crate::policy::PolicySet;
    use serde_json::json;

    fn engine() -> Engine {
        let registry = Arc::new(PolicyRegistry::new());
        PolicySet::from_sql(
            "alter table todos enable row level security;
             create policy read_own on todos for select using (auth.uid() = user_id);",
        )
        .install(&registry)
        .unwrap();

        let data: MemoryTables = serde_json::from_value(json!({
            "todos": [
                {"id": 1, "user_id": "u1"},
                {"id": 2, "user_id": "u2"},
                {"id": 3, "user_id": "u1"}
            ]
        }))
        .unwrap();

        let resolver = RoleResolver::new(
            JwtManager::new(JwtConfig::default()),
            RoleCatalog::default(),
        );
        Engine::new(resolver, registry, Arc::new(data))
    }

    #[test]
    fn test_select_filters_rows() {
        let engine = engine();
        let identity = engine
            .identify(None, Some("authenticated"), Some(json!({"sub": "u1"})))
            .unwrap();

        let mut statement = engine.begin_as(identity);
        let rows = statement.select("todos").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["user_id"] == "u1"));

        let stats = statement.finish();
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.cache.hits, 2);
    }

    #[test]
    fn test_request_without_credentials_is_anon() {
        let engine = engine();
        let request: EvaluationRequest = serde_json::from_value(json!({
            "table": "todos",
            "command": "select",
            "row": {"id": 1, "user_id": "u1"}
        }))
        .unwrap();

        let report = engine.evaluate_request(&request).unwrap();
        assert!(!report.allowed);
        assert_eq!(report.role, "anon");
        assert_eq!(report.snapshot_version, 1);
    }

    #[test]
    fn test_token_takes_precedence_over_role() {
        let engine = engine();
        let token = engine
            .resolver()
            .jwt()
            .generate_token(TokenRequest {
                sub: Some("u1".to_string()),
                ..TokenRequest::default()
            })
            .unwrap();

        let request: EvaluationRequest = serde_json::from_value(json!({
            "table": "todos",
            "command": "select",
            "role": "service_role",
            "token": token,
            "row": {"id": 2, "user_id": "u2"}
        }))
        .unwrap();

        let report = engine.evaluate_request(&request).unwrap();
        assert_eq!(report.role, "authenticated");
        assert!(!report.allowed);
    }

    #[test]
    fn test_bad_token_is_an_error() {
        let engine = engine();
        let err = engine
            .begin(&Credentials::Bearer("not-a-jwt".to_string()))
            .err()
            .unwrap();
        assert_eq!(err.code(), "RLS_AUTHENTICATION_ERROR");
    }

    #[test]
    fn test_statement_pins_snapshot() {
        let engine = engine();
        let identity = engine.identify(None, Some("anon"), None).unwrap();
        let mut statement = engine.begin_as(identity);

        engine
            .registry()
            .apply(crate::policy::SchemaChange::SetRls {
                table: "todos".to_string(),
                enabled: false,
            })
            .unwrap();

        assert_eq!(statement.snapshot_version(), 1);
        assert!(statement.select("todos").unwrap().is_empty());

        let identity = engine.identify(None, Some("anon"), None).unwrap();
        let mut next = engine.begin_as(identity);
        assert_eq!(next.select("todos").unwrap().len(), 3);
    }

    #[test]
    fn test_cancelled_statement() {
        let engine = engine();
        let identity = engine.identify(None, Some("anon"), None).unwrap();
        let mut statement = engine.begin_as(identity);
        let flag = CancellationFlag::new();
        statement.attach_cancellation(flag.clone());

        flag.cancel();
        assert_eq!(statement.select("todos"), Err(EvalError::Cancelled));
    }

    #[test]
    fn test_unknown_table_select() {
        let engine = engine();
        let identity = engine.identify(None, None, None).unwrap();
        let mut statement = engine.begin_as(identity);
        assert!(matches!(
            statement.select("missing"),
            Err(EvalError::UnknownTable { .. })
        ));
    }
}
