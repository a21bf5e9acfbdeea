//! Policy predicates and policy scripts, parsed with `sqlparser`
//!
//! Predicates accept the idioms used in policy documentation:
//!
//! ```text
//! auth.uid() = user_id
//! (select auth.uid()) = user_id
//! (auth.jwt() ->> 'aal') = 'aal2'
//! team_id in (select m.team_id from members m where m.user_id = auth.uid())
//! exists (select 1 from members m where m.team_id = todos.team_id)
//! ```
//!
//! Expressions go through the PostgreSQL dialect and are lowered into
//! [`Expr`]. Scripts accept `create policy`, `drop policy` and the
//! `alter table` forms that toggle row level security or set the owner;
//! their clauses are read off the same token stream. Type casts
//! (`::text`, `::uuid`) are accepted and ignored.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Number, Value};
use sqlparser::ast::{
    BinaryOperator, Expr as SqlExpr, Ident, JsonOperator, ObjectName, Query, SelectItem, SetExpr,
    TableFactor, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::{Location, Token, Word};

use super::errors::{PolicyError, PolicyResult};
use super::expr::{CompareOp, ContextFn, Expr, Subquery};
use super::registry::SchemaChange;
use super::types::{Command, Policy};

static DIALECT: PostgreSqlDialect = PostgreSqlDialect {};

// ==================
// Positions
// ==================

/// Byte offset of a 1-based line/column location; line 0 is end of input
fn byte_offset(src: &str, line: u64, column: u64) -> usize {
    if line == 0 {
        return src.len();
    }
    let mut start = 0;
    for _ in 1..line {
        match src[start..].find('\n') {
            Some(i) => start += i + 1,
            None => return src.len(),
        }
    }
    src[start..]
        .char_indices()
        .nth(column.saturating_sub(1) as usize)
        .map_or(src.len(), |(i, _)| start + i)
}

fn location_offset(src: &str, location: Location) -> usize {
    byte_offset(src, location.line, location.column)
}

/// Map a `sqlparser` error to a positioned parse error
///
/// The location embedded in the message wins; `fallback` is used when the
/// message carries none.
fn sql_error(src: &str, error: ParserError, fallback: usize) -> PolicyError {
    static LOCATION: OnceLock<Regex> = OnceLock::new();
    let message = match error {
        ParserError::TokenizerError(m) | ParserError::ParserError(m) => m,
        ParserError::RecursionLimitExceeded => "expression nested too deeply".to_string(),
    };
    let pattern = LOCATION.get_or_init(|| {
        Regex::new(r"\s*at Line: (\d+), Column:? (\d+)").expect("static regex")
    });

    match pattern.captures(&message) {
        Some(caps) => {
            let line = caps[1].parse().unwrap_or(0);
            let column = caps[2].parse().unwrap_or(0);
            let text = pattern.replace(&message, "").into_owned();
            PolicyError::parse(byte_offset(src, line, column), text)
        }
        None => PolicyError::parse(fallback, message),
    }
}

// ==================
// Names
// ==================

/// Unquoted names fold to lowercase; quoted names keep their case
fn name_of(value: &str, quote_style: Option<char>) -> String {
    match quote_style {
        Some(_) => value.to_string(),
        None => value.to_ascii_lowercase(),
    }
}

fn ident_name(ident: &Ident) -> String {
    name_of(&ident.value, ident.quote_style)
}

fn word_name(word: &Word) -> String {
    name_of(&word.value, word.quote_style)
}

/// `[schema.]name`, returning the unqualified name
fn object_name(name: &ObjectName) -> Option<String> {
    name.0.last().map(ident_name)
}

// ==================
// Lowering
// ==================

/// Rebind `base <arrow> right` so the arrow takes only the leftmost operand of `right`
///
/// The PostgreSQL dialect parses everything after `->`/`->>` as the key, so
/// `jwt() ->> 'aal' = 'aal2'` arrives as `jwt() ->> ('aal' = 'aal2')`.
fn rebind_arrow(base: SqlExpr, operator: JsonOperator, right: SqlExpr) -> SqlExpr {
    match right {
        SqlExpr::BinaryOp { left, op, right } => SqlExpr::BinaryOp {
            left: Box::new(rebind_arrow(base, operator, *left)),
            op,
            right,
        },
        SqlExpr::JsonAccess {
            left,
            operator: next,
            right,
        } => rebind_arrow(rebind_arrow(base, operator, *left), next, *right),
        SqlExpr::IsNull(inner) => SqlExpr::IsNull(Box::new(rebind_arrow(base, operator, *inner))),
        SqlExpr::IsNotNull(inner) => {
            SqlExpr::IsNotNull(Box::new(rebind_arrow(base, operator, *inner)))
        }
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => SqlExpr::InList {
            expr: Box::new(rebind_arrow(base, operator, *expr)),
            list,
            negated,
        },
        SqlExpr::InSubquery {
            expr,
            subquery,
            negated,
        } => SqlExpr::InSubquery {
            expr: Box::new(rebind_arrow(base, operator, *expr)),
            subquery,
            negated,
        },
        key => SqlExpr::JsonAccess {
            left: Box::new(base),
            operator,
            right: Box::new(key),
        },
    }
}

fn binds_loosely(expr: &SqlExpr) -> bool {
    matches!(
        expr,
        SqlExpr::BinaryOp { .. }
            | SqlExpr::JsonAccess { .. }
            | SqlExpr::IsNull(_)
            | SqlExpr::IsNotNull(_)
            | SqlExpr::InList { .. }
            | SqlExpr::InSubquery { .. }
    )
}

/// Operands of a chain of one boolean operator, left to right
fn flatten<'e>(expr: &'e SqlExpr, target: &BinaryOperator, out: &mut Vec<&'e SqlExpr>) {
    match expr {
        SqlExpr::BinaryOp { left, op, right } if op == target => {
            flatten(left, target, out);
            flatten(right, target, out);
        }
        other => out.push(other),
    }
}

fn compare_op(op: &BinaryOperator) -> Option<CompareOp> {
    match op {
        BinaryOperator::Eq => Some(CompareOp::Eq),
        BinaryOperator::NotEq => Some(CompareOp::Ne),
        BinaryOperator::Lt => Some(CompareOp::Lt),
        BinaryOperator::LtEq => Some(CompareOp::Le),
        BinaryOperator::Gt => Some(CompareOp::Gt),
        BinaryOperator::GtEq => Some(CompareOp::Ge),
        _ => None,
    }
}

fn number(text: &str) -> Option<Number> {
    match text.parse::<i64>() {
        Ok(i) => Some(Number::from(i)),
        Err(_) => text.parse::<f64>().ok().and_then(Number::from_f64),
    }
}

/// Table a subquery reads, with the alias that names it
struct Scope {
    table: String,
    alias: Option<String>,
}

enum SelectBody {
    /// `(select <expr>)` with no `from`: a cached scalar
    Scalar(Expr),
    /// A single-table read and its lowered select item
    Table {
        subquery: Subquery,
        item: Option<Expr>,
    },
}

/// Converts `sqlparser` expressions into policy expressions
struct Lowering<'t> {
    /// Table the policy protects
    table: &'t str,
    /// Enclosing subqueries, innermost last
    scopes: Vec<Scope>,
    /// Offset reported for errors found after parsing
    position: usize,
}

impl<'t> Lowering<'t> {
    fn new(table: &'t str, position: usize) -> Self {
        Self {
            table,
            scopes: Vec::new(),
            position,
        }
    }

    fn error<T>(&self, message: impl Into<String>) -> PolicyResult<T> {
        Err(PolicyError::parse(self.position, message))
    }

    fn lower(&mut self, expr: &SqlExpr) -> PolicyResult<Expr> {
        match expr {
            SqlExpr::Identifier(ident) => Ok(Expr::col(ident_name(ident))),
            SqlExpr::CompoundIdentifier(parts) => self.qualified_column(parts),
            SqlExpr::Value(value) => self.literal(value),
            SqlExpr::Nested(inner) => self.lower(inner),
            SqlExpr::Cast { expr, .. } => self.lower(expr),
            SqlExpr::UnaryOp {
                op: UnaryOperator::Not,
                expr,
            } => Ok(Expr::not(self.lower(expr)?)),
            SqlExpr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match expr.as_ref() {
                SqlExpr::Value(SqlValue::Number(text, _)) => {
                    match number(&format!("-{}", text)) {
                        Some(n) => Ok(Expr::lit(Value::Number(n))),
                        None => self.error(format!("invalid number '-{}'", text)),
                    }
                }
                _ => self.error("expected number after '-'"),
            },
            SqlExpr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And | BinaryOperator::Or => {
                    let mut operands = Vec::new();
                    flatten(expr, op, &mut operands);
                    let args = operands
                        .into_iter()
                        .map(|operand| self.lower(operand))
                        .collect::<PolicyResult<Vec<_>>>()?;
                    Ok(match op {
                        BinaryOperator::And => Expr::and(args),
                        _ => Expr::or(args),
                    })
                }
                _ => match compare_op(op) {
                    Some(op) => Ok(Expr::compare(op, self.lower(left)?, self.lower(right)?)),
                    None => self.error(format!("unsupported operator '{}'", op)),
                },
            },
            SqlExpr::JsonAccess {
                left,
                operator,
                right,
            } => {
                if binds_loosely(right) {
                    let rebound = rebind_arrow(
                        left.as_ref().clone(),
                        operator.clone(),
                        right.as_ref().clone(),
                    );
                    return self.lower(&rebound);
                }
                let as_text = match operator {
                    JsonOperator::Arrow => false,
                    JsonOperator::LongArrow => true,
                    other => return self.error(format!("unsupported JSON operator '{}'", other)),
                };
                let key = match right.as_ref() {
                    SqlExpr::Value(SqlValue::SingleQuotedString(s)) => s.clone(),
                    SqlExpr::Value(SqlValue::Number(n, _)) => n.clone(),
                    _ => return self.error("expected JSON key after arrow"),
                };
                Ok(Expr::JsonField {
                    base: Box::new(self.lower(left)?),
                    key,
                    as_text,
                })
            }
            SqlExpr::IsNull(arg) => Ok(Expr::IsNull {
                arg: Box::new(self.lower(arg)?),
                negated: false,
            }),
            SqlExpr::IsNotNull(arg) => Ok(Expr::IsNull {
                arg: Box::new(self.lower(arg)?),
                negated: true,
            }),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => Ok(Expr::InList {
                arg: Box::new(self.lower(expr)?),
                list: list
                    .iter()
                    .map(|item| self.lower(item))
                    .collect::<PolicyResult<Vec<_>>>()?,
                negated: *negated,
            }),
            SqlExpr::InSubquery {
                expr,
                subquery,
                negated,
            } => {
                let arg = self.lower(expr)?;
                match self.select(subquery)? {
                    SelectBody::Table {
                        mut subquery,
                        item: Some(Expr::Column { name }),
                    } => {
                        subquery.column = Some(name);
                        Ok(Expr::InSubquery {
                            arg: Box::new(arg),
                            subquery,
                            negated: *negated,
                        })
                    }
                    _ => self.error("subquery in IN must select a single column from a table"),
                }
            }
            SqlExpr::Exists { subquery, negated } => match self.select(subquery)? {
                SelectBody::Table { subquery, .. } => {
                    let exists = Expr::Exists { subquery };
                    Ok(if *negated { Expr::not(exists) } else { exists })
                }
                SelectBody::Scalar(_) => self.error("EXISTS requires a FROM clause"),
            },
            SqlExpr::Subquery(query) => match self.select(query)? {
                SelectBody::Scalar(expr) => Ok(expr),
                SelectBody::Table { .. } => {
                    self.error("scalar subqueries over tables are not supported")
                }
            },
            SqlExpr::Function(function) => {
                let name = function.name.to_string();
                if !function.args.is_empty() {
                    return self.error(format!("{}() takes no arguments", name));
                }
                match ContextFn::from_name(&name) {
                    Some(function) => Ok(Expr::call(function)),
                    None => self.error(format!("unknown function {}()", name)),
                }
            }
            other => self.error(format!("unsupported expression: {}", other)),
        }
    }

    fn literal(&self, value: &SqlValue) -> PolicyResult<Expr> {
        match value {
            SqlValue::Null => Ok(Expr::null()),
            SqlValue::Boolean(b) => Ok(Expr::lit(*b)),
            SqlValue::SingleQuotedString(s) | SqlValue::EscapedStringLiteral(s) => {
                Ok(Expr::lit(s.clone()))
            }
            SqlValue::Number(text, _) => match number(text) {
                Some(n) => Ok(Expr::lit(Value::Number(n))),
                None => self.error(format!("invalid number '{}'", text)),
            },
            other => self.error(format!("unsupported literal {}", other)),
        }
    }

    /// `qualifier.column`, resolved against the innermost subquery first
    ///
    /// Inside a subquery the qualifier names either the subquery's table
    /// (by alias when it has one) or the protected table, which makes the
    /// reference correlated.
    fn qualified_column(&self, parts: &[Ident]) -> PolicyResult<Expr> {
        let names: Vec<String> = parts.iter().map(ident_name).collect();
        let (qualifier, column) = match names.as_slice() {
            [column] => return Ok(Expr::col(column.clone())),
            [qualifier, column] | [_, qualifier, column] => (qualifier, column),
            _ => return self.error("too many qualifiers in column reference"),
        };

        match self.scopes.last() {
            Some(scope) => {
                let inner = match &scope.alias {
                    Some(alias) => alias == qualifier,
                    None => &scope.table == qualifier,
                };
                if inner {
                    return Ok(Expr::col(column.clone()));
                }
                if qualifier == self.table {
                    return Ok(Expr::outer(column.clone()));
                }
            }
            None if qualifier == self.table => return Ok(Expr::col(column.clone())),
            None => {}
        }
        self.error(format!("unknown table reference '{}'", qualifier))
    }

    /// Lower a subquery; the FROM table is in scope for the select item and filter
    fn select(&mut self, query: &Query) -> PolicyResult<SelectBody> {
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            other => return self.error(format!("unsupported subquery: {}", other)),
        };

        let item = match select.projection.as_slice() {
            [SelectItem::UnnamedExpr(expr)] | [SelectItem::ExprWithAlias { expr, .. }] => {
                Some(expr)
            }
            [SelectItem::Wildcard(..)] => None,
            _ => return self.error("subquery must select exactly one expression"),
        };

        let from = match select.from.as_slice() {
            [] => {
                return match (item, &select.selection) {
                    (Some(expr), None) => Ok(SelectBody::Scalar(self.lower(expr)?)),
                    (None, _) => self.error("expected FROM after '*'"),
                    (Some(_), Some(_)) => self.error("WHERE requires a FROM clause"),
                }
            }
            [from] if from.joins.is_empty() => from,
            _ => return self.error("subquery must read a single table without joins"),
        };

        let (table, alias) = match &from.relation {
            TableFactor::Table { name, alias, .. } => match object_name(name) {
                Some(table) => (table, alias.as_ref().map(|a| ident_name(&a.name))),
                None => return self.error("expected table name"),
            },
            other => return self.error(format!("unsupported FROM item: {}", other)),
        };

        self.scopes.push(Scope {
            table: table.clone(),
            alias,
        });
        let item = item.map(|expr| self.lower(expr)).transpose();
        let filter = select
            .selection
            .as_ref()
            .map(|expr| self.lower(expr))
            .transpose();
        self.scopes.pop();

        let item = item?;
        if let Some(item) = &item {
            if !matches!(item, Expr::Column { .. } | Expr::Literal { .. } | Expr::OuterColumn { .. }) {
                return self.error("subquery must select a column or a constant");
            }
        }

        Ok(SelectBody::Table {
            subquery: Subquery {
                table,
                column: None,
                filter: filter?.map(Box::new),
            },
            item,
        })
    }
}

// ==================
// Statements
// ==================

/// Reads policy DDL from the `sqlparser` token stream
///
/// `create policy` and the row-security forms of `alter table` are walked
/// token by token; every clause expression is handed to
/// [`Parser::parse_expr`].
struct PolicyParser<'a> {
    src: &'a str,
    parser: Parser<'a>,
}

impl<'a> PolicyParser<'a> {
    fn new(src: &'a str) -> PolicyResult<Self> {
        let parser = Parser::new(&DIALECT)
            .try_with_sql(src)
            .map_err(|e| sql_error(src, e, 0))?;
        Ok(Self { src, parser })
    }

    fn position(&self) -> usize {
        location_offset(self.src, self.parser.peek_token().location)
    }

    fn error<T>(&self, message: impl Into<String>) -> PolicyResult<T> {
        Err(PolicyError::parse(self.position(), message))
    }

    fn is_eof(&self) -> bool {
        matches!(self.parser.peek_token().token, Token::EOF)
    }

    fn is_kw(&self, kw: &str) -> bool {
        match self.parser.peek_token().token {
            Token::Word(ref word) => word.quote_style.is_none() && word.value.eq_ignore_ascii_case(kw),
            _ => false,
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.parser.next_token();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PolicyResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            self.error(format!("expected '{}'", kw))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        self.parser.consume_token(token)
    }

    fn expect(&mut self, token: &Token) -> PolicyResult<()> {
        if self.eat(token) {
            Ok(())
        } else {
            self.error(format!("expected '{}'", token))
        }
    }

    fn ident(&mut self) -> PolicyResult<String> {
        match self.parser.peek_token().token {
            Token::Word(ref word) => {
                self.parser.next_token();
                Ok(word_name(word))
            }
            _ => self.error("expected identifier"),
        }
    }

    /// `[schema.]name`, returning the unqualified name
    fn table_name(&mut self) -> PolicyResult<String> {
        let mut name = self.ident()?;
        while self.eat(&Token::Period) {
            name = self.ident()?;
        }
        Ok(name)
    }

    /// One expression, lowered against the protected `table`
    fn expr(&mut self, table: &str) -> PolicyResult<Expr> {
        let start = self.position();
        let parsed = match self.parser.parse_expr() {
            Ok(parsed) => parsed,
            Err(e) => return Err(sql_error(self.src, e, self.position())),
        };
        Lowering::new(table, start).lower(&parsed)
    }

    /// `( expr )`
    fn clause(&mut self, table: &str) -> PolicyResult<Expr> {
        self.expect(&Token::LParen)?;
        let expr = self.expr(table)?;
        self.expect(&Token::RParen)?;
        Ok(expr)
    }

    fn expect_eof(&self) -> PolicyResult<()> {
        if self.is_eof() {
            Ok(())
        } else {
            self.error("unexpected trailing input")
        }
    }

    fn script(&mut self) -> PolicyResult<Vec<SchemaChange>> {
        let mut changes = Vec::new();
        loop {
            while self.eat(&Token::SemiColon) {}
            if self.is_eof() {
                return Ok(changes);
            }
            changes.push(self.statement()?);
            if !self.eat(&Token::SemiColon) && !self.is_eof() {
                return self.error("expected ';' between statements");
            }
        }
    }

    fn statement(&mut self) -> PolicyResult<SchemaChange> {
        if self.eat_kw("create") {
            self.expect_kw("policy")?;
            return self.create_policy();
        }
        if self.eat_kw("drop") {
            self.expect_kw("policy")?;
            if self.eat_kw("if") {
                self.expect_kw("exists")?;
            }
            let name = self.ident()?;
            self.expect_kw("on")?;
            let table = self.table_name()?;
            return Ok(SchemaChange::DropPolicy { table, name });
        }
        if self.eat_kw("alter") {
            self.expect_kw("table")?;
            return self.alter_table();
        }
        self.error("expected CREATE POLICY, DROP POLICY or ALTER TABLE")
    }

    fn create_policy(&mut self) -> PolicyResult<SchemaChange> {
        let name = self.ident()?;
        self.expect_kw("on")?;
        let table = self.table_name()?;

        let mut policy = Policy::new(name, table.clone(), Command::All);

        if self.eat_kw("as") {
            if self.eat_kw("restrictive") {
                policy.permissive = false;
            } else {
                self.expect_kw("permissive")?;
            }
        }

        if self.eat_kw("for") {
            let start = self.position();
            let cmd = self.ident()?;
            policy.command = Command::parse(&cmd)
                .ok_or_else(|| PolicyError::parse(start, format!("unknown command '{}'", cmd)))?;
        }

        if self.eat_kw("to") {
            policy.roles.push(self.ident()?);
            while self.eat(&Token::Comma) {
                policy.roles.push(self.ident()?);
            }
        }

        if self.eat_kw("using") {
            policy.using = Some(self.clause(&table)?);
        }

        if self.eat_kw("with") {
            self.expect_kw("check")?;
            policy.with_check = Some(self.clause(&table)?);
        }

        policy.validate()?;
        Ok(SchemaChange::CreatePolicy(policy))
    }

    fn alter_table(&mut self) -> PolicyResult<SchemaChange> {
        self.eat_kw("only");
        let table = self.table_name()?;

        if self.eat_kw("owner") {
            self.expect_kw("to")?;
            let owner = self.ident()?;
            return Ok(SchemaChange::SetOwner { table, owner });
        }

        let change = if self.eat_kw("enable") {
            SchemaChange::SetRls {
                table,
                enabled: true,
            }
        } else if self.eat_kw("disable") {
            SchemaChange::SetRls {
                table,
                enabled: false,
            }
        } else if self.eat_kw("force") {
            SchemaChange::ForceRls { table, force: true }
        } else if self.eat_kw("no") {
            self.expect_kw("force")?;
            SchemaChange::ForceRls {
                table,
                force: false,
            }
        } else {
            return self.error("expected ENABLE, DISABLE, FORCE, NO FORCE or OWNER TO");
        };

        self.expect_kw("row")?;
        self.expect_kw("level")?;
        self.expect_kw("security")?;
        Ok(change)
    }
}

/// Parse a policy predicate protecting `table`
pub fn parse_predicate(src: &str, table: &str) -> PolicyResult<Expr> {
    let mut parser = PolicyParser::new(src)?;
    let expr = parser.expr(table)?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse a script of policy DDL statements
pub fn parse_script(src: &str) -> PolicyResult<Vec<SchemaChange>> {
    PolicyParser::new(src)?.script()
}
