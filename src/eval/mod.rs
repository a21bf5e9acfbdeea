//! Row-level security evaluation
//!
//! Predicates are evaluated with SQL three-valued logic against a single
//! row inside a [`RequestContext`]. The [`AccessGate`] combines the
//! applicable policies of a snapshot into an allow/deny decision.

pub mod cache;
pub mod context;
pub mod errors;
pub mod evaluator;
pub mod gate;
pub mod source;

pub use cache::{CacheKey, CacheStats, SessionCache};
pub use context::{CancellationFlag, RequestContext, StatementStats};
pub use errors::{EvalError, EvalResult, StatementError};
pub use evaluator::{PredicateEvaluator, Truth};
pub use gate::{AccessGate, Clause, Decision, DenyReason, Grant, WriteOutcome};
pub use source::{row_from_value, MemoryTables, NoTables, Row, TableSource};
