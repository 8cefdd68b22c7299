use chrono::{DateTime, NaiveDate, Weekday};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::slots::DEFAULT_SUGGESTIONS;
use crate::model::*;

/// Status change requested through `UPDATE bookings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Cancel,
    Close(CloseOutcome),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfessional {
        id: Ulid,
        email: String,
        name: String,
    },
    InsertWorkingHours {
        professional_id: Ulid,
        weekday: Weekday,
        window: WallWindow,
    },
    DeleteWorkingHours {
        professional_id: Ulid,
        weekday: Weekday,
    },
    InsertService {
        service: Service,
    },
    InsertBlock {
        id: Ulid,
        professional_id: Ulid,
        kind: BlockKind,
        reason: Option<String>,
    },
    DeleteBlock {
        id: Ulid,
    },
    SelectBlocks {
        professional_id: Ulid,
    },
    SelectAvailability {
        professional_id: Ulid,
        service_id: Option<Ulid>,
        date: NaiveDate,
        step_ms: Option<Ms>,
    },
    SelectSuggestions {
        professional_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        preferred: Option<WallClock>,
        max: usize,
    },
    InsertBooking {
        professional_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        start: Ms,
        client_name: String,
        client_email: String,
    },
    SelectBookingByToken {
        token: String,
    },
    CancelByToken {
        token: String,
        reason: Option<String>,
    },
    UpdateBookingStatus {
        id: Ulid,
        professional_id: Ulid,
        change: StatusChange,
        reason: Option<String>,
    },
    SelectBookings {
        professional_id: Ulid,
        filter: ReservationFilter,
    },
    SelectBookingStats {
        professional_id: Ulid,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Default column order when an INSERT names no columns.
fn default_columns(table: &str) -> &'static [&'static str] {
    match table {
        "professionals" => &["id", "email", "name"],
        "working_hours" => &["professional_id", "weekday", "start", "end"],
        "services" => &["id", "professional_id", "name", "duration", "price"],
        "blocks" => &[
            "id",
            "professional_id",
            "kind",
            "date",
            "start",
            "end",
            "weekday",
            "reason",
        ],
        "bookings" => &[
            "professional_id",
            "service_id",
            "staff_id",
            "start",
            "client_name",
            "client_email",
        ],
        _ => &[],
    }
}

/// One VALUES row keyed by column name. NULLs are dropped.
struct Row<'a> {
    table: &'static str,
    values: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
            .filter(|e| !matches!(extract_value(e), Some(Value::Null)))
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let table: &'static str = match table.as_str() {
        "professionals" => "professionals",
        "working_hours" => "working_hours",
        "services" => "services",
        "blocks" => "blocks",
        "bookings" => "bookings",
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns(table).iter().map(|c| c.to_string()).collect()
    } else {
        insert
            .columns
            .iter()
            .map(|c| c.value.to_lowercase())
            .collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = Row {
        table,
        values: columns.into_iter().zip(values.iter()).collect(),
    };

    match table {
        "professionals" => Ok(Command::InsertProfessional {
            id: parse_ulid(row.require("id")?)?,
            email: parse_string(row.require("email")?)?,
            name: parse_string(row.require("name")?)?,
        }),
        "working_hours" => Ok(Command::InsertWorkingHours {
            professional_id: parse_ulid(row.require("professional_id")?)?,
            weekday: parse_weekday_expr(row.require("weekday")?)?,
            window: parse_window(row.require("start")?, row.require("end")?)?,
        }),
        "services" => {
            let minutes = parse_i64(row.require("duration")?)?;
            Ok(Command::InsertService {
                service: Service {
                    id: parse_ulid(row.require("id")?)?,
                    professional_id: parse_ulid(row.require("professional_id")?)?,
                    name: parse_string(row.require("name")?)?,
                    duration_ms: minutes.saturating_mul(MINUTE_MS),
                    price_cents: row.get("price").map(parse_i64).transpose()?,
                },
            })
        }
        "blocks" => Ok(Command::InsertBlock {
            id: parse_ulid(row.require("id")?)?,
            professional_id: parse_ulid(row.require("professional_id")?)?,
            kind: parse_block_kind(&row)?,
            reason: row.get("reason").map(parse_string).transpose()?,
        }),
        "bookings" => Ok(Command::InsertBooking {
            professional_id: parse_ulid(row.require("professional_id")?)?,
            service_id: parse_ulid(row.require("service_id")?)?,
            staff_id: row.get("staff_id").map(parse_ulid).transpose()?,
            start: parse_instant(row.require("start")?)?,
            client_name: parse_string(row.require("client_name")?)?,
            client_email: parse_string(row.require("client_email")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn parse_block_kind(row: &Row<'_>) -> Result<BlockKind, SqlError> {
    let kind = parse_string(row.require("kind")?)?;
    match kind.to_lowercase().as_str() {
        "full_day" => Ok(BlockKind::FullDay {
            date: parse_date(row.require("date")?)?,
        }),
        "time_slot" => {
            let start = parse_instant(row.require("start")?)?;
            let end = parse_instant(row.require("end")?)?;
            if start >= end {
                return Err(SqlError::Parse("time_slot start must be before end".into()));
            }
            Ok(BlockKind::TimeSlot {
                span: Span::new(start, end),
            })
        }
        "recurring" => Ok(BlockKind::Recurring {
            weekday: parse_weekday_expr(row.require("weekday")?)?,
            window: parse_window(row.require("start")?, row.require("end")?)?,
        }),
        other => Err(SqlError::Parse(format!(
            "unknown block kind '{other}' (expected full_day, time_slot or recurring)"
        ))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let preds = predicates(delete.selection.as_ref())?;

    match table.as_str() {
        "blocks" => Ok(Command::DeleteBlock {
            id: parse_ulid(require_eq(&preds, "id")?)?,
        }),
        "working_hours" => Ok(Command::DeleteWorkingHours {
            professional_id: parse_ulid(require_eq(&preds, "professional_id")?)?,
            weekday: parse_weekday_expr(require_eq(&preds, "weekday")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let preds = predicates(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            professional_id: parse_ulid(require_eq(&preds, "professional_id")?)?,
            service_id: find_eq(&preds, "service_id").map(parse_ulid).transpose()?,
            date: parse_date(require_eq(&preds, "date")?)?,
            step_ms: find_eq(&preds, "step")
                .map(|e| parse_i64(e).map(|m| m.saturating_mul(MINUTE_MS)))
                .transpose()?,
        }),
        "suggestions" => Ok(Command::SelectSuggestions {
            professional_id: parse_ulid(require_eq(&preds, "professional_id")?)?,
            service_id: parse_ulid(require_eq(&preds, "service_id")?)?,
            date: parse_date(require_eq(&preds, "date")?)?,
            preferred: find_eq(&preds, "preferred").map(parse_clock).transpose()?,
            max: match find_eq(&preds, "max") {
                Some(e) => usize::try_from(parse_i64(e)?)
                    .map_err(|_| SqlError::Parse("max must not be negative".into()))?,
                None => DEFAULT_SUGGESTIONS,
            },
        }),
        "bookings" => {
            if let Some(token) = find_eq(&preds, "token") {
                return Ok(Command::SelectBookingByToken {
                    token: parse_string(token)?,
                });
            }
            let professional_id = parse_ulid(require_eq(&preds, "professional_id")?)?;
            let mut filter = ReservationFilter {
                status: find_eq(&preds, "status").map(parse_string).transpose()?,
                service_id: find_eq(&preds, "service_id").map(parse_ulid).transpose()?,
                staff_id: find_eq(&preds, "staff_id").map(parse_ulid).transpose()?,
                search: find_eq(&preds, "search").map(parse_string).transpose()?,
                ..Default::default()
            };
            for p in preds.iter().filter(|p| p.column == "start") {
                match p.op {
                    ast::BinaryOperator::GtEq => filter.from = Some(parse_instant(p.value)?),
                    ast::BinaryOperator::LtEq => filter.until = Some(parse_instant(p.value)?),
                    _ => {}
                }
            }
            Ok(Command::SelectBookings {
                professional_id,
                filter,
            })
        }
        "booking_stats" => Ok(Command::SelectBookingStats {
            professional_id: parse_ulid(require_eq(&preds, "professional_id")?)?,
        }),
        "blocks" => Ok(Command::SelectBlocks {
            professional_id: parse_ulid(require_eq(&preds, "professional_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "bookings" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut status = None;
    let mut reason = None;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            _ => None,
        };
        match column.as_deref() {
            Some("status") => status = Some(parse_string(&assignment.value)?),
            Some("reason") => {
                if !matches!(extract_value(&assignment.value), Some(Value::Null)) {
                    reason = Some(parse_string(&assignment.value)?);
                }
            }
            Some(other) => {
                return Err(SqlError::Unsupported(format!("cannot update column {other}")));
            }
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }
    let status = status.ok_or(SqlError::MissingColumn("bookings", "status"))?;
    let change = match status.to_lowercase().as_str() {
        "cancelled" | "canceled" => StatusChange::Cancel,
        "completed" => StatusChange::Close(CloseOutcome::Completed),
        "no_show" | "no-show" => StatusChange::Close(CloseOutcome::NoShow),
        other => return Err(SqlError::Parse(format!("cannot set status to '{other}'"))),
    };

    let preds = predicates(selection)?;
    if let Some(token) = find_eq(&preds, "token") {
        if change != StatusChange::Cancel {
            return Err(SqlError::Unsupported(
                "a cancellation token can only cancel".into(),
            ));
        }
        return Ok(Command::CancelByToken {
            token: parse_string(token)?,
            reason,
        });
    }
    Ok(Command::UpdateBookingStatus {
        id: parse_ulid(require_eq(&preds, "id")?)?,
        professional_id: parse_ulid(require_eq(&preds, "professional_id")?)?,
        change,
        reason,
    })
}

// ── WHERE clauses ─────────────────────────────────────────────

/// One `column <op> value` term of an AND-only WHERE clause.
struct Predicate<'a> {
    column: String,
    op: ast::BinaryOperator,
    value: &'a Expr,
}

fn predicates(selection: Option<&Expr>) -> Result<Vec<Predicate<'_>>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_predicates(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push(Predicate {
                column,
                op: op.clone(),
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn find_eq<'a>(preds: &[Predicate<'a>], column: &str) -> Option<&'a Expr> {
    preds
        .iter()
        .find(|p| p.column == column && p.op == ast::BinaryOperator::Eq)
        .map(|p| p.value)
}

fn require_eq<'a>(preds: &[Predicate<'a>], column: &'static str) -> Result<&'a Expr, SqlError> {
    find_eq(preds, column).ok_or(SqlError::MissingFilter(column))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected ULID string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
            .map_err(|e| SqlError::Parse(format!("bad integer '{s}': {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, or an RFC 3339 string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp '{s}': {e}")));
    }
    parse_i64(expr)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_clock(expr: &Expr) -> Result<WallClock, SqlError> {
    let s = parse_string(expr)?;
    WallClock::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad time '{s}' (expected HH:MM)")))
}

fn parse_window(start: &Expr, end: &Expr) -> Result<WallWindow, SqlError> {
    WallWindow::new(parse_clock(start)?, parse_clock(end)?)
        .ok_or_else(|| SqlError::Parse("window start must be before end".into()))
}

fn parse_weekday_expr(expr: &Expr) -> Result<Weekday, SqlError> {
    let s = parse_string(expr)?;
    parse_weekday(&s).ok_or_else(|| SqlError::Parse(format!("bad weekday '{s}'")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing value for {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
