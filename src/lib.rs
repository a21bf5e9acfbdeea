//! rlsgate - Row-level security policy evaluator
//!
//! Reproduces Postgres-style row-level security outside the database:
//! roles resolved from request credentials, permissive and restrictive
//! policies per table and command, `USING` / `WITH CHECK` predicates with
//! SQL three-valued logic, and statement-scoped memoization of
//! `auth.*()` context functions.

pub mod auth;
pub mod cli;
pub mod config;
pub mod engine;
pub mod eval;
pub mod harness;
pub mod observability;
pub mod policy;

pub use engine::{Engine, EngineSettings, EvaluationReport, EvaluationRequest, Statement};
