use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed statement.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `id` is `None` when the client sent NULL and wants one generated.
    InsertBooking {
        id: Option<Ulid>,
        room_id: Ulid,
        requester: String,
        purpose: String,
        start: Ms,
        end: Ms,
        /// `RETURNING *`: answer with the admitted row.
        returning: bool,
    },
    SetStatus {
        id: Ulid,
        status: BookingStatus,
    },
    Reschedule {
        id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBooking {
        id: Ulid,
    },
    SelectBookings {
        room_id: Option<Ulid>,
    },
    SelectConflicts {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Columns of `bookings` in positional INSERT order.
const INSERT_COLUMNS: [&str; 6] = ["id", "room_id", "requester", "purpose", "start", "end"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;

    // Slot i holds the value for INSERT_COLUMNS[i].
    let mut slots: [Option<&Expr>; 6] = [None; 6];
    if insert.columns.is_empty() {
        if values.len() != INSERT_COLUMNS.len() {
            return Err(SqlError::WrongArity("bookings", INSERT_COLUMNS.len(), values.len()));
        }
        for (slot, value) in slots.iter_mut().zip(values) {
            *slot = Some(value);
        }
    } else {
        if values.len() != insert.columns.len() {
            return Err(SqlError::WrongArity("bookings", insert.columns.len(), values.len()));
        }
        for (column, value) in insert.columns.iter().zip(values) {
            let name = column.value.to_lowercase();
            let Some(i) = INSERT_COLUMNS.iter().position(|c| *c == name) else {
                return Err(SqlError::UnknownColumn(name));
            };
            if slots[i].replace(value).is_some() {
                return Err(SqlError::Parse(format!("column {name} given twice")));
            }
        }
    }

    let [id, room_id, requester, purpose, start, end] = slots;
    Ok(Command::InsertBooking {
        id: id.map(parse_ulid_or_null).transpose()?.flatten(),
        room_id: parse_ulid(required(room_id, "room_id")?)?,
        requester: parse_string(required(requester, "requester")?)?,
        purpose: purpose
            .map(parse_string_or_null)
            .transpose()?
            .flatten()
            .unwrap_or_default(),
        start: parse_i64(required(start, "start")?)?,
        end: parse_i64(required(end, "end")?)?,
        returning: insert.returning.is_some(),
    })
}

fn required<'a>(slot: Option<&'a Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    slot.ok_or(SqlError::MissingColumn(column))
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;

    let (mut status, mut start, mut end) = (None, None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "status" => {
                let text = parse_string(&assignment.value)?;
                status = Some(text.parse::<BookingStatus>().map_err(SqlError::Parse)?);
            }
            "start" => start = Some(parse_i64(&assignment.value)?),
            "end" => end = Some(parse_i64(&assignment.value)?),
            other => return Err(SqlError::ReadOnlyColumn(other.to_string())),
        }
    }

    match (status, start, end) {
        (Some(BookingStatus::Pending), None, None) => Err(SqlError::Unsupported(
            "status can only be set to approved or rejected".into(),
        )),
        (Some(status), None, None) => Ok(Command::SetStatus { id, status }),
        (None, Some(start), Some(end)) => Ok(Command::Reschedule { id, start, end }),
        (None, None, None) => Err(SqlError::Parse("UPDATE without SET".into())),
        (Some(_), _, _) => Err(SqlError::Unsupported(
            "status and span cannot change in one statement".into(),
        )),
        (None, _, _) => Err(SqlError::MissingFilter("start and end")),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::DeleteBooking {
        id: extract_where_id(&delete.selection)?,
    })
}

#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    room_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" if filters.start.is_some() || filters.end.is_some() => Err(
            SqlError::Unsupported("time-window filter on bookings, use conflicts".into()),
        ),
        "conflicts" if filters.id.is_some() => {
            Err(SqlError::Unsupported("id filter on conflicts".into()))
        }
        "bookings" => match filters.id {
            Some(id) => Ok(Command::SelectBooking { id }),
            None => Ok(Command::SelectBookings {
                room_id: filters.room_id,
            }),
        },
        "conflicts" => Ok(Command::SelectConflicts {
            room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Supported predicates are `id =`, `room_id =`, `start >=` and `"end" <=`
/// joined by AND. Anything else is refused rather than dropped.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    let unsupported = || SqlError::Unsupported(format!("filter {expr}"));
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)
        }
        Expr::BinaryOp { left, op, right } => {
            let repeated = match (op, expr_column_name(left).as_deref()) {
                (ast::BinaryOperator::Eq, Some("id")) => {
                    filters.id.replace(parse_ulid(right)?).is_some()
                }
                (ast::BinaryOperator::Eq, Some("room_id")) => {
                    filters.room_id.replace(parse_ulid(right)?).is_some()
                }
                (ast::BinaryOperator::GtEq, Some("start")) => {
                    filters.start.replace(parse_i64(right)?).is_some()
                }
                (ast::BinaryOperator::LtEq, Some("end")) => {
                    filters.end.replace(parse_i64(right)?).is_some()
                }
                _ => return Err(unsupported()),
            };
            if repeated {
                return Err(unsupported());
            }
            Ok(())
        }
        _ => Err(unsupported()),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

/// First VALUES row. Multi-row inserts are refused: each booking is admitted on its own.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.as_slice()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected ULID, got NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ulid::from_string(s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected string or NULL, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected string, got NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad i64 {s}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    ReadOnlyColumn(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column cannot be updated: {c}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
