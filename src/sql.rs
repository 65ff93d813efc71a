use std::fmt;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SelectItem, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::table::{Column, Table};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// One or more `VALUES` rows, created in order.
    Insert {
        table: Table,
        rows: Vec<Vec<Assignment>>,
        returning: bool,
    },
    Update {
        table: Table,
        id: Ulid,
        assignments: Vec<Assignment>,
        returning: bool,
    },
    Delete {
        table: Table,
        id: Ulid,
    },
    Select {
        table: Table,
        /// Column indexes to return, in order.
        projection: Vec<usize>,
        filters: Vec<Filter>,
    },
}

impl Command {
    pub fn table(&self) -> Table {
        match self {
            Command::Insert { table, .. }
            | Command::Update { table, .. }
            | Command::Delete { table, .. }
            | Command::Select { table, .. } => *table,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: &'static Column,
    pub value: Literal,
}

/// A constant as written in the statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Null,
    Text(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => f.write_str("NULL"),
            Literal::Text(s) => write!(f, "'{s}'"),
            Literal::Int(n) => write!(f, "{n}"),
            Literal::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like { case_insensitive: bool, negated: bool },
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn accepts(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::NotEq => ordering != Equal,
            CompareOp::Lt => ordering == Less,
            CompareOp::LtEq => ordering != Greater,
            CompareOp::Gt => ordering == Greater,
            CompareOp::GtEq => ordering != Less,
            CompareOp::Like { .. } | CompareOp::IsNull | CompareOp::IsNotNull => false,
        }
    }
}

/// One `column op literal` conjunct of a `WHERE` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: usize,
    pub op: CompareOp,
    pub value: Literal,
}

/// Parse every statement of a (possibly multi-statement) query string.
pub fn parse_statements(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

/// Parse exactly one statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_statements(sql)?;
    if commands.len() > 1 {
        return Err(SqlError::Unsupported(
            "multiple statements in a prepared query".into(),
        ));
    }
    Ok(commands.remove(0))
}

/// The table and columns a statement returns rows from, if any. Literals are
/// not evaluated, so this works on statements with `$n` placeholders.
pub fn describe(sql: &str) -> Result<Option<(Table, Vec<usize>)>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Ok(None);
    };
    let all = |table: Table| (table, (0..table.columns().len()).collect());
    match stmt {
        Statement::Insert(insert) if parse_returning(&insert.returning)? => {
            Ok(Some(all(resolve_table(insert_table_name(insert)?)?)))
        }
        Statement::Update { table, returning, .. } if parse_returning(returning)? => {
            Ok(Some(all(resolve_table(table_factor_name(&table.relation)?)?)))
        }
        Statement::Query(query) => {
            let (table, projection, _) = select_target(query)?;
            Ok(Some((table, projection)))
        }
        _ => Ok(None),
    }
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = resolve_table(insert_table_name(insert)?)?;
    if insert.columns.is_empty() {
        return Err(SqlError::Unsupported(
            "INSERT needs an explicit column list".into(),
        ));
    }
    let columns = insert
        .columns
        .iter()
        .map(|ident| column_ref(table, &ident.value))
        .collect::<Result<Vec<_>, _>>()?;

    let rows = extract_insert_rows(insert)?
        .iter()
        .enumerate()
        .map(|(i, row)| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(table.name(), columns.len(), row.len()));
            }
            columns
                .iter()
                .zip(row)
                .map(|(&column, expr)| -> Result<Assignment, SqlError> {
                    Ok(Assignment {
                        column,
                        value: parse_literal(expr)
                            .map_err(|e| SqlError::Parse(format!("row {}: {e}", i + 1)))?,
                    })
                })
                .collect::<Result<Vec<_>, SqlError>>()
        })
        .collect::<Result<Vec<Vec<Assignment>>, SqlError>>()?;

    Ok(Command::Insert {
        table,
        rows,
        returning: parse_returning(&insert.returning)?,
    })
}

fn parse_update(
    target: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: &Option<Vec<SelectItem>>,
) -> Result<Command, SqlError> {
    let table = resolve_table(table_factor_name(&target.relation)?)?;
    let id = extract_where_id(selection)?;
    let assignments = assignments
        .iter()
        .map(|assignment| {
            let name = match &assignment.target {
                AssignmentTarget::ColumnName(name) => object_name_last(name)
                    .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
                AssignmentTarget::Tuple(_) => {
                    return Err(SqlError::Unsupported("tuple assignment".into()));
                }
            };
            let column = column_ref(table, &name)?;
            if column.name == "id" {
                return Err(SqlError::ReadOnly("id"));
            }
            Ok(Assignment {
                column,
                value: parse_literal(&assignment.value)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Command::Update {
        table,
        id,
        assignments,
        returning: parse_returning(returning)?,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = resolve_table(delete_table_name(delete)?)?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::Delete { table, id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let (table, projection, select) = select_target(query)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        extract_filters(table, selection, &mut filters)?;
    }

    Ok(Command::Select {
        table,
        projection,
        filters,
    })
}

fn select_target(query: &ast::Query) -> Result<(Table, Vec<usize>, &ast::Select), SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    if select.from.len() > 1 || !select.from[0].joins.is_empty() {
        return Err(SqlError::Unsupported("joins".into()));
    }
    let table = resolve_table(table_factor_name(&select.from[0].relation)?)?;

    let mut projection = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => projection.extend(0..table.columns().len()),
            SelectItem::UnnamedExpr(expr) => {
                let name = expr_column_name(expr)
                    .ok_or_else(|| SqlError::Unsupported(format!("select expression {expr}")))?;
                projection.push(table.column_index(&name)?);
            }
            other => return Err(SqlError::Unsupported(format!("select item {other}"))),
        }
    }
    Ok((table, projection, select))
}

/// Flatten an `AND` tree of comparisons.
fn extract_filters(table: Table, expr: &Expr, out: &mut Vec<Filter>) -> Result<(), SqlError> {
    let column = |e: &Expr| -> Result<usize, SqlError> {
        let name = expr_column_name(e)
            .ok_or_else(|| SqlError::Unsupported(format!("filter on expression {e}")))?;
        table.column_index(&name)
    };

    match expr {
        Expr::Nested(inner) => extract_filters(table, inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    extract_filters(table, left, out)?;
                    return extract_filters(table, right, out);
                }
                ast::BinaryOperator::Eq => CompareOp::Eq,
                ast::BinaryOperator::NotEq => CompareOp::NotEq,
                ast::BinaryOperator::Lt => CompareOp::Lt,
                ast::BinaryOperator::LtEq => CompareOp::LtEq,
                ast::BinaryOperator::Gt => CompareOp::Gt,
                ast::BinaryOperator::GtEq => CompareOp::GtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            out.push(Filter {
                column: column(left)?,
                op,
                value: parse_literal(right)?,
            });
            Ok(())
        }
        Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => {
            out.push(Filter {
                column: column(expr)?,
                op: CompareOp::Like {
                    case_insensitive: false,
                    negated: *negated,
                },
                value: parse_literal(pattern)?,
            });
            Ok(())
        }
        Expr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => {
            out.push(Filter {
                column: column(expr)?,
                op: CompareOp::Like {
                    case_insensitive: true,
                    negated: *negated,
                },
                value: parse_literal(pattern)?,
            });
            Ok(())
        }
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            let op = if matches!(expr, Expr::IsNull(_)) {
                CompareOp::IsNull
            } else {
                CompareOp::IsNotNull
            };
            out.push(Filter {
                column: column(inner)?,
                op,
                value: Literal::Null,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn parse_returning(returning: &Option<Vec<SelectItem>>) -> Result<bool, SqlError> {
    match returning {
        None => Ok(false),
        Some(items) if items.iter().all(|i| matches!(i, SelectItem::Wildcard(_))) => Ok(true),
        Some(_) => Err(SqlError::Unsupported("only RETURNING * is supported".into())),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn resolve_table(name: String) -> Result<Table, SqlError> {
    Table::from_name(&name).ok_or(SqlError::UnknownTable(name))
}

fn column_ref(table: Table, name: &str) -> Result<&'static Column, SqlError> {
    let index = table.column_index(&name.to_lowercase())?;
    Ok(&table.columns()[index])
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if values.rows.is_empty() => {
            Err(SqlError::Parse("empty VALUES".into()))
        }
        SetExpr::Values(values) => Ok(&values.rows),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => match parse_literal(right)? {
            Literal::Text(s) => Ulid::from_string(s.trim())
                .map_err(|e| SqlError::BadLiteral(format!("bad ULID '{s}': {e}"))),
            other => Err(SqlError::BadLiteral(format!("expected ULID, got {other}"))),
        },
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_literal(expr: &Expr) -> Result<Literal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::SingleQuotedString(s) => Ok(Literal::Text(s.clone())),
            Value::Number(s, _) => s
                .parse()
                .map(Literal::Int)
                .map_err(|e| SqlError::BadLiteral(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::BadLiteral(format!("unsupported literal {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        match parse_literal(expr)? {
            Literal::Int(n) => Ok(Literal::Int(-n)),
            other => Err(SqlError::BadLiteral(format!("cannot negate {other}"))),
        }
    } else if let Expr::Nested(inner) = expr {
        parse_literal(inner)
    } else {
        Err(SqlError::Unsupported(format!("expected a literal, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    /// A literal that cannot be read as the column's type.
    BadLiteral(String),
    /// A well-formed literal the column does not accept.
    InvalidValue(&'static str, String),
    NotNull(&'static str),
    ReadOnly(&'static str),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::Parse(_) | SqlError::Empty | SqlError::WrongArity(..) => "42601",
            SqlError::Unsupported(_) => "0A000",
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(..) => "42703",
            SqlError::MissingFilter(_) => "42601",
            SqlError::BadLiteral(_) => "22P02",
            SqlError::InvalidValue(..) => "22023",
            SqlError::NotNull(_) => "23502",
            SqlError::ReadOnly(_) => "428C9",
        }
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadLiteral(s) => write!(f, "invalid input syntax: {s}"),
            SqlError::InvalidValue(col, s) => write!(f, "invalid value for {col}: {s}"),
            SqlError::NotNull(col) => write!(f, "column {col} cannot be NULL"),
            SqlError::ReadOnly(col) => write!(f, "column {col} cannot be written"),
        }
    }
}

impl std::error::Error for SqlError {}
