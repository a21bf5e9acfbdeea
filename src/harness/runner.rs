//! Fixture runner
//!
//! Each case is its own statement. With more than one worker the cases are
//! spread over scoped threads sharing the engine; results keep case order.

use std::thread;

use serde::Serialize;
use tracing::{info, warn};

use super::fixture::{Case, Expectation};
use crate::engine::Engine;
use crate::eval::StatementError;
use crate::observability::Event;

/// What a case actually produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Observed {
    Allow { reason: String },
    Deny { reason: String },
    Error { code: String, message: String },
    Visible { rows: usize },
}

impl Observed {
    pub fn matches(&self, expected: Expectation) -> bool {
        match (self, expected) {
            (Observed::Allow { .. }, Expectation::Allow)
            | (Observed::Deny { .. }, Expectation::Deny)
            | (Observed::Error { .. }, Expectation::Error) => true,
            (Observed::Visible { rows }, Expectation::Visible(n)) => *rows == n,
            _ => false,
        }
    }

    fn error(e: StatementError) -> Self {
        Observed::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub expected: Expectation,
    pub observed: Observed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub snapshot_version: u64,
    pub results: Vec<CaseResult>,
}

impl FixtureReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

pub struct FixtureRunner<'e> {
    engine: &'e Engine,
    workers: usize,
}

impl<'e> FixtureRunner<'e> {
    pub fn new(engine: &'e Engine) -> Self {
        Self { engine, workers: 1 }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn run(&self, cases: &[Case]) -> FixtureReport {
        let snapshot_version = self.engine.registry().version();
        info!(
            event = Event::FixtureStart.as_str(),
            cases = cases.len(),
            workers = self.workers,
            snapshot_version,
        );

        let results: Vec<CaseResult> = if self.workers == 1 || cases.len() < 2 {
            cases.iter().map(|case| self.run_case(case)).collect()
        } else {
            self.run_parallel(cases)
        };

        let passed = results.iter().filter(|r| r.passed).count();
        let report = FixtureReport {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            snapshot_version,
            results,
        };

        info!(
            event = Event::FixtureComplete.as_str(),
            total = report.total,
            passed = report.passed,
            failed = report.failed,
        );
        report
    }

    fn run_parallel(&self, cases: &[Case]) -> Vec<CaseResult> {
        let workers = self.workers.min(cases.len());
        let mut indexed: Vec<(usize, CaseResult)> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    scope.spawn(move || {
                        cases
                            .iter()
                            .enumerate()
                            .skip(worker)
                            .step_by(workers)
                            .map(|(i, case)| (i, self.run_case(case)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(results) => results,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    pub fn run_case(&self, case: &Case) -> CaseResult {
        let observed = self.observe(case);
        let passed = observed.matches(case.expect);
        if !passed {
            warn!(
                event = Event::CaseFailed.as_str(),
                case = %case.name,
                expected = %case.expect,
                observed = ?observed,
            );
        }
        CaseResult {
            name: case.name.clone(),
            passed,
            expected: case.expect,
            observed,
        }
    }

    fn observe(&self, case: &Case) -> Observed {
        let identity = match self.engine.identify(
            case.token.as_deref(),
            case.role.as_deref(),
            case.claims.clone(),
        ) {
            Ok(identity) => identity,
            Err(e) => return Observed::error(e.into()),
        };
        let mut statement = self.engine.begin_as(identity);

        let observed = match (case.expect, case.row.as_ref()) {
            (Expectation::Visible(_), _) => match statement.select(&case.table) {
                Ok(rows) => Observed::Visible { rows: rows.len() },
                Err(e) => Observed::error(e.into()),
            },
            (_, Some(row)) => {
                match statement.evaluate(&case.table, case.command, row, case.proposed_row.as_ref())
                {
                    Ok(decision) if decision.is_allowed() => Observed::Allow {
                        reason: decision.reason(),
                    },
                    Ok(decision) => Observed::Deny {
                        reason: decision.reason(),
                    },
                    Err(e) => Observed::error(e.into()),
                }
            }
            (_, None) => Observed::Error {
                code: "RLS_INVALID_CASE".to_string(),
                message: "case has no row".to_string(),
            },
        };

        statement.finish();
        observed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtConfig, JwtManager, RoleCatalog, RoleResolver};
    use crate::engine::EngineSettings;
    use crate::harness::Fixture;

    const FIXTURE: &str = r#"{
        "sql": "alter table todos enable row level security; create policy read_own on todos for select using (auth.uid() = user_id);",
        "data": {"todos": [{"id": 1, "user_id": "u1"}, {"id": 2, "user_id": "u2"}]},
        "cases": [
            {"name": "own row", "table": "todos", "command": "select", "role": "authenticated",
             "claims": {"sub": "u1"}, "row": {"id": 1, "user_id": "u1"}, "expect": "allow"},
            {"name": "other row", "table": "todos", "command": "select", "role": "authenticated",
             "claims": {"sub": "u1"}, "row": {"id": 2, "user_id": "u2"}, "expect": "deny"},
            {"name": "scan", "table": "todos", "command": "select", "role": "authenticated",
             "claims": {"sub": "u2"}, "expect": {"visible": 1}},
            {"name": "no insert policy", "table": "todos", "command": "insert", "role": "authenticated",
             "claims": {"sub": "u1"}, "row": {"id": 3, "user_id": "u1"}, "expect": "deny"},
            {"name": "bad column", "table": "todos", "command": "select", "role": "authenticated",
             "row": {"id": 3}, "expect": "error"},
            {"name": "unknown role", "table": "todos", "command": "select", "role": "nobody",
             "row": {"id": 3, "user_id": "u1"}, "expect": "allow"}
        ]
    }"#;

    fn setup() -> (Engine, Vec<Case>) {
        let resolver = RoleResolver::new(JwtManager::new(JwtConfig::default()), RoleCatalog::default());
        let (engine, cases, _) = Fixture::from_json(FIXTURE)
            .unwrap()
            .into_engine(resolver, EngineSettings::default())
            .unwrap();
        (engine, cases)
    }

    #[test]
    fn test_run_reports_each_case() {
        let (engine, cases) = setup();
        let report = FixtureRunner::new(&engine).run(&cases);

        assert_eq!(report.total, 6);
        assert_eq!(report.passed, 5);
        assert!(!report.is_success());

        let failed: Vec<_> = report.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "unknown role");
        assert!(matches!(
            &failed[0].observed,
            Observed::Error { code, .. } if code == "RLS_AUTHENTICATION_ERROR"
        ));
    }

    #[test]
    fn test_parallel_run_keeps_order_and_results() {
        let (engine, cases) = setup();
        let serial = FixtureRunner::new(&engine).run(&cases);
        let parallel = FixtureRunner::new(&engine).with_workers(4).run(&cases);

        let names = |r: &FixtureReport| r.results.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&serial), names(&parallel));
        assert_eq!(serial.passed, parallel.passed);
        for (a, b) in serial.results.iter().zip(&parallel.results) {
            assert_eq!(a.observed, b.observed);
        }
    }
}
