//! Policy model, SQL parsing and the versioned registry

pub mod errors;
pub mod expr;
pub mod lint;
pub mod loader;
pub mod parser;
pub mod registry;
pub mod types;

pub use errors::{PolicyError, PolicyResult};
pub use expr::{CompareOp, ContextFn, Expr, Subquery};
pub use lint::{lint, LintKind, LintWarning};
pub use loader::{load_policy_file, LoadReport, PolicySet};
pub use parser::{parse_predicate, parse_script};
pub use registry::{PolicyRegistry, PolicySnapshot, SchemaChange};
pub use types::{Command, Operation, Policy, PolicyDef, TableRls};
