use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        capacity: u32,
        overflow: OverflowPolicy,
    },
    /// Fields left `None` keep their current value. `name: Some(None)` clears the name.
    UpdateResource {
        id: Ulid,
        name: Option<Option<String>>,
        capacity: Option<u32>,
        overflow: Option<OverflowPolicy>,
    },
    SetResourceOpen {
        id: Ulid,
        open: bool,
    },
    DeleteResource {
        id: Ulid,
    },
    SelectResources,
    InsertReservation {
        resource_id: Ulid,
        subject_id: String,
        notes: Option<String>,
    },
    CancelReservation {
        id: Ulid,
        acting_subject: String,
    },
    CompleteReservation {
        id: Ulid,
    },
    SelectReservation {
        id: Ulid,
    },
    SelectReservations {
        resource_id: Ulid,
        subject_id: Option<String>,
    },
    SelectWaitlist {
        resource_id: Ulid,
    },
    SelectAvailability {
        resource_id: Ulid,
    },
}

const RESOURCE_COLUMNS: &[&str] = &["id", "capacity", "overflow", "name"];
const RESERVATION_COLUMNS: &[&str] = &["resource_id", "subject_id", "notes"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let row = named_insert_values(insert, RESOURCE_COLUMNS)?;
            let id = parse_ulid_expr(required(&row, "id")?)?;
            let capacity = match column(&row, "capacity") {
                Some(e) => parse_u32(e)?,
                None => 1,
            };
            let overflow = match column(&row, "overflow") {
                Some(e) => parse_overflow_or_null(e)?.unwrap_or_default(),
                None => OverflowPolicy::default(),
            };
            let name = match column(&row, "name") {
                Some(e) => parse_string_or_null(e)?,
                None => None,
            };
            Ok(Command::InsertResource {
                id,
                name,
                capacity,
                overflow,
            })
        }
        "reservations" => {
            let row = named_insert_values(insert, RESERVATION_COLUMNS)?;
            let notes = match column(&row, "notes") {
                Some(e) => parse_string_or_null(e)?,
                None => None,
            };
            Ok(Command::InsertReservation {
                resource_id: parse_ulid_expr(required(&row, "resource_id")?)?,
                subject_id: parse_string_expr(required(&row, "subject_id")?)?,
                notes,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let filters = where_filters(selection);
    let id = parse_ulid_expr(filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((col, &a.value));
    }

    match table.as_str() {
        "resources" => {
            if let Some((_, value)) = sets.iter().find(|(c, _)| c == "open") {
                if sets.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "open must be updated on its own".into(),
                    ));
                }
                return Ok(Command::SetResourceOpen {
                    id,
                    open: parse_bool(value)?,
                });
            }
            let (mut name, mut capacity, mut overflow) = (None, None, None);
            for (col, value) in &sets {
                match col.as_str() {
                    "name" => name = Some(parse_string_or_null(value)?),
                    "capacity" => capacity = Some(parse_u32(value)?),
                    "overflow" => overflow = parse_overflow_or_null(value)?,
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateResource {
                id,
                name,
                capacity,
                overflow,
            })
        }
        "reservations" => match sets.as_slice() {
            [(col, value)] if col == "state" => {
                let state = parse_string_expr(value)?;
                match ReservationState::parse(&state) {
                    Some(ReservationState::Completed) => Ok(Command::CompleteReservation { id }),
                    Some(ReservationState::Cancelled) => Err(SqlError::Unsupported(
                        "cancel with DELETE FROM reservations".into(),
                    )),
                    _ => Err(SqlError::Unsupported(format!("state change to {state}"))),
                }
            }
            _ => Err(SqlError::Unsupported("only SET state may be updated".into())),
        },
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(&delete.selection);
    let id = parse_ulid_expr(filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "reservations" => {
            let acting = filter(&filters, "acting_subject")
                .ok_or(SqlError::MissingFilter("acting_subject"))?;
            Ok(Command::CancelReservation {
                id,
                acting_subject: parse_string_expr(acting)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_filters(&select.selection);
    let resource_id = || -> Result<Ulid, SqlError> {
        parse_ulid_expr(filter(&filters, "resource_id").ok_or(SqlError::MissingFilter("resource_id"))?)
    };

    match table.as_str() {
        "resources" => Ok(Command::SelectResources),
        "reservations" => {
            if let Some(id) = filter(&filters, "id") {
                return Ok(Command::SelectReservation {
                    id: parse_ulid_expr(id)?,
                });
            }
            let subject_id = match filter(&filters, "subject_id") {
                Some(e) => Some(parse_string_expr(e)?),
                None => None,
            };
            Ok(Command::SelectReservations {
                resource_id: resource_id()?,
                subject_id,
            })
        }
        "waitlist" => Ok(Command::SelectWaitlist {
            resource_id: resource_id()?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            resource_id: resource_id()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// `column = value` pairs from a WHERE clause joined by AND. Anything else is ignored.
fn where_filters(selection: &Option<Expr>) -> Vec<(String, &Expr)> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, &**right));
                }
            }
            Expr::Nested(inner) => walk(inner, out),
            _ => {}
        }
    }
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out);
    }
    out
}

fn filter<'a>(filters: &[(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
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

/// The single VALUES row paired with its column names. Without a column
/// list, values are taken in `default_order`.
fn named_insert_values(
    insert: &ast::Insert,
    default_order: &[&str],
) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            [row] => row.clone(),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };

    let names: Vec<String> = if insert.columns.is_empty() {
        default_order.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() > names.len() {
        return Err(SqlError::WrongArity("columns", names.len(), values.len()));
    }
    for name in &names {
        if !default_order.contains(&name.as_str()) {
            return Err(SqlError::UnknownColumn(name.clone()));
        }
    }
    Ok(names.into_iter().zip(values).collect())
}

fn column<'a>(row: &'a [(String, Expr)], col: &str) -> Option<&'a Expr> {
    row.iter().find(|(c, _)| c == col).map(|(_, e)| e)
}

fn required<'a>(row: &'a [(String, Expr)], col: &'static str) -> Result<&'a Expr, SqlError> {
    column(row, col).ok_or(SqlError::MissingColumn(col))
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_overflow_or_null(expr: &Expr) -> Result<Option<OverflowPolicy>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(None),
        Some(s) => OverflowPolicy::parse(&s)
            .map(Some)
            .ok_or_else(|| SqlError::Parse(format!("bad overflow policy: {s}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_resource_defaults() {
        let cmd = parse_sql(&format!("INSERT INTO resources (id) VALUES ('{ID}')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertResource {
                id: ulid(ID),
                name: None,
                capacity: 1,
                overflow: OverflowPolicy::Waitlist,
            }
        );
    }

    #[test]
    fn parse_insert_resource_named_columns_any_order() {
        let sql = format!(
            "INSERT INTO resources (name, overflow, capacity, id) VALUES ('Pottery', 'reject', 12, '{ID}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertResource {
                id: ulid(ID),
                name: Some("Pottery".into()),
                capacity: 12,
                overflow: OverflowPolicy::Reject,
            }
        );
    }

    #[test]
    fn parse_insert_resource_positional() {
        let sql = format!("INSERT INTO resources VALUES ('{ID}', 5, NULL, NULL)");
        match parse_sql(&sql).unwrap() {
            Command::InsertResource { capacity, overflow, name, .. } => {
                assert_eq!(capacity, 5);
                assert_eq!(overflow, OverflowPolicy::Waitlist);
                assert_eq!(name, None);
            }
            other => panic!("expected InsertResource, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_resource_bad_overflow() {
        let sql = format!("INSERT INTO resources (id, overflow) VALUES ('{ID}', 'drop')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            "INSERT INTO reservations (resource_id, subject_id, notes) VALUES ('{ID}', 'learner-7', '{{\"diet\":\"vegan\"}}')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertReservation {
                resource_id: ulid(ID),
                subject_id: "learner-7".into(),
                notes: Some("{\"diet\":\"vegan\"}".into()),
            }
        );
    }

    #[test]
    fn parse_insert_reservation_requires_subject() {
        let sql = format!("INSERT INTO reservations (resource_id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("subject_id"))));
    }

    #[test]
    fn parse_insert_unknown_column() {
        let sql = format!("INSERT INTO reservations (resource_id, seat) VALUES ('{ID}', 'A1')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_))));
    }

    #[test]
    fn parse_update_resource_capacity() {
        let sql = format!("UPDATE resources SET capacity = 8 WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateResource {
                id: ulid(ID),
                name: None,
                capacity: Some(8),
                overflow: None,
            }
        );
    }

    #[test]
    fn parse_update_resource_clear_name_and_policy() {
        let sql = format!("UPDATE resources SET name = NULL, overflow = 'reject' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateResource {
                id: ulid(ID),
                name: Some(None),
                capacity: None,
                overflow: Some(OverflowPolicy::Reject),
            }
        );
    }

    #[test]
    fn parse_update_resource_open() {
        let close = format!("UPDATE resources SET open = false WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&close).unwrap(),
            Command::SetResourceOpen { id: ulid(ID), open: false }
        );
        let mixed = format!("UPDATE resources SET open = true, capacity = 2 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&mixed), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE resources SET capacity = 2"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_complete_reservation() {
        let sql = format!("UPDATE reservations SET state = 'completed' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CompleteReservation { id: ulid(ID) }
        );
        let other = format!("UPDATE reservations SET state = 'confirmed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&other), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_cancel_reservation() {
        let sql = format!(
            "DELETE FROM reservations WHERE id = '{ID}' AND acting_subject = 'admin-1'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelReservation {
                id: ulid(ID),
                acting_subject: "admin-1".into(),
            }
        );
        let anonymous = format!("DELETE FROM reservations WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&anonymous),
            Err(SqlError::MissingFilter("acting_subject"))
        ));
    }

    #[test]
    fn parse_delete_resource() {
        let sql = format!("DELETE FROM resources WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteResource { id: ulid(ID) });
    }

    #[test]
    fn parse_select_reservations() {
        let by_resource = format!("SELECT * FROM reservations WHERE resource_id = '{ID}'");
        assert_eq!(
            parse_sql(&by_resource).unwrap(),
            Command::SelectReservations { resource_id: ulid(ID), subject_id: None }
        );
        let by_subject = format!(
            "SELECT * FROM reservations WHERE resource_id = '{ID}' AND subject_id = 'x'"
        );
        assert_eq!(
            parse_sql(&by_subject).unwrap(),
            Command::SelectReservations {
                resource_id: ulid(ID),
                subject_id: Some("x".into()),
            }
        );
        let by_id = format!("SELECT * FROM reservations WHERE id = '{OTHER}'");
        assert_eq!(
            parse_sql(&by_id).unwrap(),
            Command::SelectReservation { id: ulid(OTHER) }
        );
    }

    #[test]
    fn parse_select_waitlist_and_availability() {
        let w = format!("SELECT * FROM waitlist WHERE resource_id = '{ID}'");
        assert_eq!(parse_sql(&w).unwrap(), Command::SelectWaitlist { resource_id: ulid(ID) });
        let a = format!("SELECT * FROM availability WHERE (resource_id = '{ID}')");
        assert_eq!(parse_sql(&a).unwrap(), Command::SelectAvailability { resource_id: ulid(ID) });
        assert!(matches!(
            parse_sql("SELECT * FROM waitlist"),
            Err(SqlError::MissingFilter("resource_id"))
        ));
    }

    #[test]
    fn parse_select_resources() {
        assert_eq!(parse_sql("SELECT * FROM resources").unwrap(), Command::SelectResources);
    }

    #[test]
    fn parse_bad_ulid() {
        assert!(matches!(
            parse_sql("SELECT * FROM waitlist WHERE resource_id = 'nope'"),
            Err(SqlError::Parse(_))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
