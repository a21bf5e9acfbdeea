//! Per-statement request context
//!
//! Carries the resolved identity, the session cache, and the interrupt
//! state for one statement. Never shared across statements.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::cache::{CacheKey, CacheStats, SessionCache};
use super::errors::{EvalError, EvalResult};
use crate::auth::Identity;
use crate::policy::expr::ContextFn;

/// Shared flag a caller flips to cancel a running statement
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of a finished statement
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementStats {
    pub statement_id: Uuid,
    pub role: String,
    pub cache: CacheStats,
    pub elapsed_micros: u128,
}

#[derive(Debug)]
pub struct RequestContext {
    statement_id: Uuid,
    identity: Identity,
    cache: SessionCache,
    cancel: CancellationFlag,
    started: Instant,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(identity: Identity) -> Self {
        Self {
            statement_id: Uuid::new_v4(),
            identity,
            cache: SessionCache::default(),
            cancel: CancellationFlag::new(),
            started: Instant::now(),
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.started + timeout);
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.set_cancellation(flag);
        self
    }

    pub fn set_cancellation(&mut self, flag: CancellationFlag) {
        self.cancel = flag;
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache = SessionCache::new(enabled);
        self
    }

    pub fn statement_id(&self) -> Uuid {
        self.statement_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn role_name(&self) -> &str {
        &self.identity.role.name
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut SessionCache {
        &mut self.cache
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    /// Fail if the statement was cancelled or ran past its deadline
    pub fn check_interrupt(&self) -> EvalResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(EvalError::StatementTimeout);
        }
        Ok(())
    }

    /// Value of a context function, computed at most once per statement
    pub fn context_value(&mut self, function: ContextFn) -> Value {
        let identity = &self.identity;
        self.cache
            .memoize(CacheKey::Function(function), || {
                Ok::<_, Infallible>(match function {
                    ContextFn::Uid => identity.uid(),
                    ContextFn::Role => identity.role_name(),
                    ContextFn::Jwt => identity.jwt(),
                    ContextFn::Email => identity.email(),
                })
            })
            .unwrap_or_else(|never| match never {})
    }

    /// Start the next statement for the same identity
    ///
    /// The cache is discarded; the cancellation flag carries over.
    pub fn next_statement(self) -> Self {
        let enabled = self.cache.is_enabled();
        let timeout = self.deadline.map(|d| d - self.started);
        let mut next = RequestContext::new(self.identity)
            .with_cancellation(self.cancel)
            .with_cache_enabled(enabled);
        if let Some(timeout) = timeout {
            next = next.with_timeout(timeout);
        }
        next
    }

    pub fn finish(self) -> StatementStats {
        StatementStats {
            statement_id: self.statement_id,
            role: self.identity.role.name,
            cache: self.cache.stats(),
            elapsed_micros: self.started.elapsed().as_micros(),
        }
    }
}
