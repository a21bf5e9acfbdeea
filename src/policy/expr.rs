//! Predicate expression trees
//!
//! The JSON form is internally tagged by `kind`:
//!
//! ```json
//! {"kind": "compare", "op": "eq",
//!  "left": {"kind": "call", "function": "auth.uid"},
//!  "right": {"kind": "column", "name": "user_id"}}
//! ```
//!
//! Inside a subquery filter, `column` refers to the subquery's row and
//! `outer_column` to the row the policy protects.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Functions that read the request context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContextFn {
    #[serde(rename = "auth.uid")]
    Uid,
    #[serde(rename = "auth.role")]
    Role,
    #[serde(rename = "auth.jwt")]
    Jwt,
    #[serde(rename = "auth.email")]
    Email,
}

impl ContextFn {
    pub fn name(&self) -> &'static str {
        match self {
            ContextFn::Uid => "auth.uid",
            ContextFn::Role => "auth.role",
            ContextFn::Jwt => "auth.jwt",
            ContextFn::Email => "auth.email",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "auth.uid" => Some(ContextFn::Uid),
            "auth.role" => Some(ContextFn::Role),
            "auth.jwt" => Some(ContextFn::Jwt),
            "auth.email" => Some(ContextFn::Email),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A `select <column> from <table> where <filter>` reading another table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subquery {
    pub table: String,

    /// Projected column, required for `in (select ...)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Box<Expr>>,
}

impl Subquery {
    /// True if the filter reads the protected row, making the result row-dependent
    pub fn is_correlated(&self) -> bool {
        self.filter.as_deref().is_some_and(Expr::references_outer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Value,
    },
    Column {
        name: String,
    },
    OuterColumn {
        name: String,
    },
    Call {
        function: ContextFn,
    },
    /// `base -> key` or, with `as_text`, `base ->> key`
    JsonField {
        base: Box<Expr>,
        key: String,
        #[serde(default)]
        as_text: bool,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And {
        args: Vec<Expr>,
    },
    Or {
        args: Vec<Expr>,
    },
    Not {
        arg: Box<Expr>,
    },
    IsNull {
        arg: Box<Expr>,
        #[serde(default)]
        negated: bool,
    },
    InList {
        arg: Box<Expr>,
        list: Vec<Expr>,
        #[serde(default)]
        negated: bool,
    },
    InSubquery {
        arg: Box<Expr>,
        subquery: Subquery,
        #[serde(default)]
        negated: bool,
    },
    Exists {
        subquery: Subquery,
    },
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn null() -> Self {
        Expr::Literal { value: Value::Null }
    }

    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into() }
    }

    pub fn outer(name: impl Into<String>) -> Self {
        Expr::OuterColumn { name: name.into() }
    }

    pub fn call(function: ContextFn) -> Self {
        Expr::Call { function }
    }

    pub fn uid() -> Self {
        Expr::call(ContextFn::Uid)
    }

    pub fn jwt_text(key: impl Into<String>) -> Self {
        Expr::JsonField {
            base: Box::new(Expr::call(ContextFn::Jwt)),
            key: key.into(),
            as_text: true,
        }
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::compare(CompareOp::Eq, left, right)
    }

    pub fn and(args: Vec<Expr>) -> Self {
        Expr::And { args }
    }

    pub fn or(args: Vec<Expr>) -> Self {
        Expr::Or { args }
    }

    pub fn not(arg: Expr) -> Self {
        Expr::Not { arg: Box::new(arg) }
    }

    /// Pre-order walk, descending into subquery filters
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal { .. }
            | Expr::Column { .. }
            | Expr::OuterColumn { .. }
            | Expr::Call { .. } => {}
            Expr::JsonField { base, .. } => base.visit(f),
            Expr::Compare { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::And { args } | Expr::Or { args } => {
                for arg in args {
                    arg.visit(f);
                }
            }
            Expr::Not { arg } | Expr::IsNull { arg, .. } => arg.visit(f),
            Expr::InList { arg, list, .. } => {
                arg.visit(f);
                for item in list {
                    item.visit(f);
                }
            }
            Expr::InSubquery { arg, subquery, .. } => {
                arg.visit(f);
                if let Some(filter) = &subquery.filter {
                    filter.visit(f);
                }
            }
            Expr::Exists { subquery } => {
                if let Some(filter) = &subquery.filter {
                    filter.visit(f);
                }
            }
        }
    }

    /// Tables read by subqueries anywhere in the expression
    pub fn referenced_tables(&self) -> BTreeSet<String> {
        let mut tables = BTreeSet::new();
        self.visit(&mut |e| match e {
            Expr::InSubquery { subquery, .. } | Expr::Exists { subquery } => {
                tables.insert(subquery.table.clone());
            }
            _ => {}
        });
        tables
    }

    pub fn references_outer(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, Expr::OuterColumn { .. }) {
                found = true;
            }
        });
        found
    }

    /// Context functions called anywhere in the expression
    pub fn context_functions(&self) -> BTreeSet<ContextFn> {
        let mut fns = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Call { function } = e {
                fns.insert(*function);
            }
        });
        fns
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => write!(f, "null"),
        Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
        other => write!(f, "{}", other),
    }
}

impl fmt::Display for Subquery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "select {} from {}",
            self.column.as_deref().unwrap_or("1"),
            self.table
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " where {}", filter)?;
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value } => write_literal(f, value),
            Expr::Column { name } => write!(f, "{}", name),
            Expr::OuterColumn { name } => write!(f, "outer.{}", name),
            Expr::Call { function } => write!(f, "{}()", function.name()),
            Expr::JsonField { base, key, as_text } => {
                let arrow = if *as_text { "->>" } else { "->" };
                write!(f, "{}{}'{}'", base, arrow, key.replace('\'', "''"))
            }
            Expr::Compare { op, left, right } => {
                write!(f, "{} {} {}", left, op.symbol(), right)
            }
            Expr::And { args } => {
                write!(f, "(")?;
                write_list(f, args, " and ")?;
                write!(f, ")")
            }
            Expr::Or { args } => {
                write!(f, "(")?;
                write_list(f, args, " or ")?;
                write!(f, ")")
            }
            Expr::Not { arg } => write!(f, "not ({})", arg),
            Expr::IsNull { arg, negated } => {
                write!(f, "{} is {}null", arg, if *negated { "not " } else { "" })
            }
            Expr::InList { arg, list, negated } => {
                write!(f, "{} {}in (", arg, if *negated { "not " } else { "" })?;
                write_list(f, list, ", ")?;
                write!(f, ")")
            }
            Expr::InSubquery {
                arg,
                subquery,
                negated,
            } => write!(
                f,
                "{} {}in ({})",
                arg,
                if *negated { "not " } else { "" },
                subquery
            ),
            Expr::Exists { subquery } => write!(f, "exists ({})", subquery),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_form_deserializes() {
        let expr: Expr = serde_json::from_value(json!({
            "kind": "compare",
            "op": "eq",
            "left": {"kind": "call", "function": "auth.uid"},
            "right": {"kind": "column", "name": "user_id"}
        }))
        .unwrap();

        assert_eq!(expr, Expr::eq(Expr::uid(), Expr::col("user_id")));
        assert_eq!(expr.to_string(), "auth.uid() = user_id");
    }

    #[test]
    fn test_referenced_tables_and_correlation() {
        let expr = Expr::InSubquery {
            arg: Box::new(Expr::col("team_id")),
            subquery: Subquery {
                table: "members".to_string(),
                column: Some("team_id".to_string()),
                filter: Some(Box::new(Expr::eq(Expr::col("user_id"), Expr::uid()))),
            },
            negated: false,
        };

        assert_eq!(
            expr.referenced_tables().into_iter().collect::<Vec<_>>(),
            vec!["members".to_string()]
        );
        assert!(!expr.references_outer());
        assert_eq!(
            expr.context_functions().into_iter().collect::<Vec<_>>(),
            vec![ContextFn::Uid]
        );
    }

    #[test]
    fn test_correlated_subquery() {
        let subquery = Subquery {
            table: "members".to_string(),
            column: None,
            filter: Some(Box::new(Expr::eq(
                Expr::col("team_id"),
                Expr::outer("team_id"),
            ))),
        };
        assert!(subquery.is_correlated());
        assert_eq!(
            Expr::Exists { subquery }.to_string(),
            "exists (select 1 from members where team_id = outer.team_id)"
        );
    }

    #[test]
    fn test_literal_rendering_escapes_quotes() {
        assert_eq!(Expr::lit("o'brien").to_string(), "'o''brien'");
        assert_eq!(Expr::jwt_text("aal").to_string(), "auth.jwt()->>'aal'");
    }
}
