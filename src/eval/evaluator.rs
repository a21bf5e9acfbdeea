//! Predicate evaluation
//!
//! Three-valued: a comparison involving NULL is `Unknown`, and only `True`
//! passes a policy. `and`/`or` short-circuit left to right. No implicit
//! type coercion; incompatible operands are an error, not a false.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::cache::CacheKey;
use super::context::RequestContext;
use super::errors::{EvalError, EvalResult};
use super::source::{json_type_name, Row, TableSource};
use crate::policy::expr::{CompareOp, Expr, Subquery};

/// SQL three-valued truth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    pub fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    pub fn not(self) -> Self {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    pub fn is_true(self) -> bool {
        self == Truth::True
    }

    fn into_value(self) -> Value {
        match self {
            Truth::True => Value::Bool(true),
            Truth::False => Value::Bool(false),
            Truth::Unknown => Value::Null,
        }
    }

    fn from_value(value: &Value, context: &str) -> EvalResult<Self> {
        match value {
            Value::Bool(b) => Ok(Truth::from_bool(*b)),
            Value::Null => Ok(Truth::Unknown),
            other => Err(EvalError::NotBoolean {
                context: context.to_string(),
                found: json_type_name(other).to_string(),
            }),
        }
    }
}

/// Rows in scope while evaluating
#[derive(Clone, Copy)]
struct Scope<'r> {
    row: &'r Row,
    /// The protected row, when evaluating inside a subquery
    outer: Option<&'r Row>,
}

pub struct PredicateEvaluator<'a> {
    source: &'a dyn TableSource,
}

impl<'a> PredicateEvaluator<'a> {
    pub fn new(source: &'a dyn TableSource) -> Self {
        Self { source }
    }

    /// Returns true only if the predicate is `True` for `row`
    pub fn evaluate(&self, expr: &Expr, row: &Row, ctx: &mut RequestContext) -> EvalResult<bool> {
        Ok(self.truth_of(expr, row, ctx)?.is_true())
    }

    pub fn truth_of(&self, expr: &Expr, row: &Row, ctx: &mut RequestContext) -> EvalResult<Truth> {
        self.truth(expr, Scope { row, outer: None }, ctx)
    }

    fn truth(&self, expr: &Expr, scope: Scope<'_>, ctx: &mut RequestContext) -> EvalResult<Truth> {
        match expr {
            Expr::And { args } => {
                let mut result = Truth::True;
                for arg in args {
                    match self.truth(arg, scope, ctx)? {
                        Truth::False => return Ok(Truth::False),
                        Truth::Unknown => result = Truth::Unknown,
                        Truth::True => {}
                    }
                }
                Ok(result)
            }
            Expr::Or { args } => {
                let mut result = Truth::False;
                for arg in args {
                    match self.truth(arg, scope, ctx)? {
                        Truth::True => return Ok(Truth::True),
                        Truth::Unknown => result = Truth::Unknown,
                        Truth::False => {}
                    }
                }
                Ok(result)
            }
            Expr::Not { arg } => Ok(self.truth(arg, scope, ctx)?.not()),
            Expr::Compare { op, left, right } => {
                let l = self.value(left, scope, ctx)?;
                let r = self.value(right, scope, ctx)?;
                compare(*op, &l, &r)
            }
            Expr::IsNull { arg, negated } => {
                let is_null = self.value(arg, scope, ctx)?.is_null();
                Ok(Truth::from_bool(is_null != *negated))
            }
            Expr::InList { arg, list, negated } => {
                let needle = self.value(arg, scope, ctx)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    items.push(self.value(item, scope, ctx)?);
                }
                let found = contains(&needle, &items)?;
                Ok(if *negated { found.not() } else { found })
            }
            Expr::InSubquery {
                arg,
                subquery,
                negated,
            } => {
                let needle = self.value(arg, scope, ctx)?;
                let values = self.subquery_values(subquery, scope, ctx)?;
                let found = contains(&needle, &values)?;
                Ok(if *negated { found.not() } else { found })
            }
            Expr::Exists { subquery } => self.subquery_exists(subquery, scope, ctx),
            other => {
                let value = self.value(other, scope, ctx)?;
                Truth::from_value(&value, "policy expression")
            }
        }
    }

    fn value(&self, expr: &Expr, scope: Scope<'_>, ctx: &mut RequestContext) -> EvalResult<Value> {
        match expr {
            Expr::Literal { value } => Ok(value.clone()),
            Expr::Column { name } => column(scope.row, name),
            Expr::OuterColumn { name } => match scope.outer {
                Some(outer) => column(outer, name),
                None => Err(EvalError::UnknownColumn {
                    column: format!("outer.{}", name),
                }),
            },
            Expr::Call { function } => Ok(ctx.context_value(*function)),
            Expr::JsonField { base, key, as_text } => {
                let base = self.value(base, scope, ctx)?;
                let field = match &base {
                    Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
                    Value::Array(items) => key
                        .parse::<usize>()
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                Ok(if *as_text { as_text_value(field) } else { field })
            }
            other => Ok(self.truth(other, scope, ctx)?.into_value()),
        }
    }

    /// Rows of the subquery's table whose filter is `True`
    fn matching_rows(
        &self,
        subquery: &Subquery,
        scope: Scope<'_>,
        ctx: &mut RequestContext,
    ) -> EvalResult<Vec<&'a Row>> {
        let rows = self
            .source
            .rows(&subquery.table)
            .ok_or_else(|| EvalError::UnknownTable {
                table: subquery.table.clone(),
            })?;

        let outer = scope.outer.unwrap_or(scope.row);
        let mut matched = Vec::new();
        for row in rows {
            let passes = match &subquery.filter {
                Some(filter) => self
                    .truth(filter, Scope { row, outer: Some(outer) }, ctx)?
                    .is_true(),
                None => true,
            };
            if passes {
                matched.push(row);
            }
        }
        Ok(matched)
    }

    fn subquery_values(
        &self,
        subquery: &Subquery,
        scope: Scope<'_>,
        ctx: &mut RequestContext,
    ) -> EvalResult<Vec<Value>> {
        let key = (!subquery.is_correlated()).then(|| CacheKey::subquery_values(subquery));
        if let Some(Value::Array(values)) = key.as_ref().and_then(|k| ctx.cache_mut().lookup(k)) {
            return Ok(values);
        }

        let projected = subquery
            .column
            .as_deref()
            .ok_or_else(|| EvalError::invalid("IN subquery must select a column"))?;
        let values = self
            .matching_rows(subquery, scope, ctx)?
            .into_iter()
            .map(|row| column(row, projected))
            .collect::<EvalResult<Vec<_>>>()?;

        if let Some(key) = key {
            ctx.cache_mut().store(key, Value::Array(values.clone()));
        }
        Ok(values)
    }

    fn subquery_exists(
        &self,
        subquery: &Subquery,
        scope: Scope<'_>,
        ctx: &mut RequestContext,
    ) -> EvalResult<Truth> {
        let key = (!subquery.is_correlated()).then(|| CacheKey::subquery_exists(subquery));
        if let Some(Value::Bool(exists)) = key.as_ref().and_then(|k| ctx.cache_mut().lookup(k)) {
            return Ok(Truth::from_bool(exists));
        }

        let exists = !self.matching_rows(subquery, scope, ctx)?.is_empty();

        if let Some(key) = key {
            ctx.cache_mut().store(key, Value::Bool(exists));
        }
        Ok(Truth::from_bool(exists))
    }
}

fn column(row: &Row, name: &str) -> EvalResult<Value> {
    row.get(name).cloned().ok_or_else(|| EvalError::UnknownColumn {
        column: name.to_string(),
    })
}

/// `->>` semantics: strings unquoted, everything else rendered as JSON text
fn as_text_value(value: Value) -> Value {
    match value {
        Value::Null | Value::String(_) => value,
        other => Value::String(other.to_string()),
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn mismatch(op: CompareOp, l: &Value, r: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op: op.symbol().to_string(),
        left: json_type_name(l).to_string(),
        right: json_type_name(r).to_string(),
    }
}

/// Compare two values under SQL semantics
pub fn compare(op: CompareOp, l: &Value, r: &Value) -> EvalResult<Truth> {
    if l.is_null() || r.is_null() {
        return Ok(Truth::Unknown);
    }

    let ordering = match (l, r) {
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => None,
        _ => return Err(mismatch(op, l, r)),
    };

    let result = match op {
        CompareOp::Eq => ordering.map_or(l == r, |o| o == Ordering::Equal),
        CompareOp::Ne => ordering.map_or(l != r, |o| o != Ordering::Equal),
        _ => {
            let o = ordering.ok_or_else(|| mismatch(op, l, r))?;
            match op {
                CompareOp::Lt => o == Ordering::Less,
                CompareOp::Le => o != Ordering::Greater,
                CompareOp::Gt => o == Ordering::Greater,
                _ => o != Ordering::Less,
            }
        }
    };
    Ok(Truth::from_bool(result))
}

/// `needle in (items)` with SQL NULL semantics
fn contains(needle: &Value, items: &[Value]) -> EvalResult<Truth> {
    if needle.is_null() {
        return Ok(Truth::Unknown);
    }
    let mut saw_unknown = false;
    for item in items {
        match compare(CompareOp::Eq, needle, item)? {
            Truth::True => return Ok(Truth::True),
            Truth::Unknown => saw_unknown = true,
            Truth::False => {}
        }
    }
    Ok(if saw_unknown {
        Truth::Unknown
    } else {
        Truth::False
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, Role};
    use crate::eval::source::{MemoryTables, NoTables};
    use crate::policy::parser::parse_predicate;
    use serde_json::json;

    fn ctx(sub: Option<&str>) -> RequestContext {
        let claims = sub.map(|s| json!({"sub": s, "aal": "aal1", "app_metadata": {"tier": "pro"}}));
        RequestContext::new(Identity {
            role: Role::new("authenticated"),
            claims,
        })
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn eval(src: &str, r: &Row, ctx: &mut RequestContext) -> EvalResult<Truth> {
        let expr = parse_predicate(src, "todos").unwrap();
        PredicateEvaluator::new(&NoTables).truth_of(&expr, r, ctx)
    }

    #[test]
    fn test_owner_match() {
        let r = row(json!({"user_id": "u1"}));
        assert_eq!(eval("auth.uid() = user_id", &r, &mut ctx(Some("u1"))), Ok(Truth::True));
        assert_eq!(eval("auth.uid() = user_id", &r, &mut ctx(Some("u2"))), Ok(Truth::False));
    }

    #[test]
    fn test_null_comparisons_are_unknown() {
        let r = row(json!({"user_id": null, "n": 1}));
        let mut anon = ctx(None);

        assert_eq!(eval("auth.uid() = user_id", &r, &mut anon), Ok(Truth::Unknown));
        assert_eq!(eval("not (auth.uid() = user_id)", &r, &mut anon), Ok(Truth::Unknown));
        assert_eq!(eval("user_id = user_id or n = 1", &r, &mut anon), Ok(Truth::True));
        assert_eq!(eval("user_id = user_id and n = 2", &r, &mut anon), Ok(Truth::False));
        assert_eq!(eval("user_id = user_id and n = 1", &r, &mut anon), Ok(Truth::Unknown));
        assert_eq!(eval("user_id is null", &r, &mut anon), Ok(Truth::True));
        assert_eq!(eval("null", &r, &mut anon), Ok(Truth::Unknown));
    }

    #[test]
    fn test_short_circuit_skips_failing_branch() {
        let r = row(json!({"public": true}));
        let mut c = ctx(Some("u1"));

        // `missing` would raise UnknownColumn if evaluated
        assert_eq!(eval("public or missing = 1", &r, &mut c), Ok(Truth::True));
        assert_eq!(eval("not public and missing = 1", &r, &mut c), Ok(Truth::False));
        assert!(matches!(
            eval("missing = 1 or public", &r, &mut c),
            Err(EvalError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let r = row(json!({"n": 1}));
        let result = eval("n = '1'", &r, &mut ctx(Some("u1")));
        assert_eq!(
            result,
            Err(EvalError::TypeMismatch {
                op: "=".to_string(),
                left: "numeric".to_string(),
                right: "text".to_string()
            })
        );

        let result = eval("n", &r, &mut ctx(Some("u1")));
        assert!(matches!(result, Err(EvalError::NotBoolean { .. })));
    }

    #[test]
    fn test_ordering_and_numbers() {
        let r = row(json!({"n": 10, "f": 2.5, "s": "b"}));
        let mut c = ctx(Some("u1"));
        assert_eq!(eval("n > 9 and n <= 10 and f < 3 and f >= 2.5", &r, &mut c), Ok(Truth::True));
        assert_eq!(eval("s > 'a' and s <> 'c'", &r, &mut c), Ok(Truth::True));
        assert_eq!(eval("n = 10.0", &r, &mut c), Ok(Truth::True));
    }

    #[test]
    fn test_jwt_access() {
        let r = row(json!({}));
        let mut c = ctx(Some("u1"));
        assert_eq!(eval("auth.jwt()->>'aal' = 'aal1'", &r, &mut c), Ok(Truth::True));
        assert_eq!(
            eval("auth.jwt()->'app_metadata'->>'tier' = 'pro'", &r, &mut c),
            Ok(Truth::True)
        );
        assert_eq!(eval("auth.jwt()->>'missing' = 'x'", &r, &mut c), Ok(Truth::Unknown));

        let mut anon = ctx(None);
        assert_eq!(eval("auth.jwt()->>'aal' = 'aal2'", &r, &mut anon), Ok(Truth::Unknown));
    }

    #[test]
    fn test_in_list_null_semantics() {
        let r = row(json!({"status": "open", "missing": null}));
        let mut c = ctx(Some("u1"));
        assert_eq!(eval("status in ('open', 'done')", &r, &mut c), Ok(Truth::True));
        assert_eq!(eval("status in ('done', null)", &r, &mut c), Ok(Truth::Unknown));
        assert_eq!(eval("status not in ('done')", &r, &mut c), Ok(Truth::True));
        assert_eq!(eval("missing in ('done')", &r, &mut c), Ok(Truth::Unknown));
    }

    #[test]
    fn test_uncorrelated_subquery_memoized_across_rows() {
        let tables = MemoryTables::new().with_table(
            "members",
            vec![
                row(json!({"team_id": 1, "user_id": "u1"})),
                row(json!({"team_id": 2, "user_id": "u2"})),
                row(json!({"team_id": 3, "user_id": "u1"})),
            ],
        );
        let evaluator = PredicateEvaluator::new(&tables);
        let expr = parse_predicate(
            "team_id in (select team_id from members where user_id = auth.uid())",
            "todos",
        )
        .unwrap();

        let mut c = ctx(Some("u1"));
        let mut visible = 0;
        for team in 1..=4 {
            if evaluator.evaluate(&expr, &row(json!({"team_id": team})), &mut c).unwrap() {
                visible += 1;
            }
        }

        assert_eq!(visible, 2);
        // one subquery computation plus one auth.uid() call; the uid is
        // reused for the other two member rows, the subquery for rows 2..=4
        assert_eq!(c.cache().stats().misses, 2);
        assert_eq!(c.cache().stats().hits, 5);
    }

    #[test]
    fn test_correlated_exists() {
        let tables = MemoryTables::new().with_table(
            "members",
            vec![row(json!({"team_id": 1, "user_id": "u1"}))],
        );
        let evaluator = PredicateEvaluator::new(&tables);
        let expr = parse_predicate(
            "exists (select 1 from members m where m.team_id = todos.team_id and m.user_id = auth.uid())",
            "todos",
        )
        .unwrap();

        let mut c = ctx(Some("u1"));
        assert!(evaluator.evaluate(&expr, &row(json!({"team_id": 1})), &mut c).unwrap());
        assert!(!evaluator.evaluate(&expr, &row(json!({"team_id": 2})), &mut c).unwrap());
    }

    #[test]
    fn test_unknown_subquery_table() {
        let expr = parse_predicate("exists (select 1 from nowhere)", "todos").unwrap();
        let result = PredicateEvaluator::new(&NoTables).evaluate(&expr, &row(json!({})), &mut ctx(None));
        assert_eq!(
            result,
            Err(EvalError::UnknownTable {
                table: "nowhere".to_string()
            })
        );
    }
}
