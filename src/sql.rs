use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SelectItem, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::CURRENCY_MULTIPLIER;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResort {
        name: String,
        owner: String,
        address: Address,
    },
    InsertRoom {
        spec: RoomSpec,
    },
    InsertPhoto {
        resort: String,
        room: RoomNumber,
        photo: Photo,
    },
    DeleteRoom {
        resort: String,
        room: RoomNumber,
    },
    InsertReservation {
        request: ReservationRequest,
        returning: bool,
    },
    SelectRooms {
        criteria: SearchCriteria,
    },
    CountRooms {
        criteria: SearchCriteria,
    },
    SelectAvailability {
        resort: String,
        room: RoomNumber,
        start: String,
        end: String,
    },
    SelectReservations {
        resort: String,
        room: RoomNumber,
    },
}

/// Parse a single statement. Anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    parse_batch(sql)?.into_iter().next().ok_or(SqlError::Empty)
}

/// Parse a `;`-separated script, as sent by a simple-query batch.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Values are positional; the column list is informational.
fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "resorts" => {
            if values.len() < 6 {
                return Err(SqlError::WrongArity("resorts", 6, values.len()));
            }
            Ok(Command::InsertResort {
                name: parse_string(&values[0])?,
                owner: parse_string(&values[1])?,
                address: Address {
                    country: parse_string(&values[2])?,
                    city: parse_string(&values[3])?,
                    street: parse_string(&values[4])?,
                    street_number: parse_string(&values[5])?,
                },
            })
        }
        "rooms" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("rooms", 8, values.len()));
            }
            let amenities = match values.get(8) {
                Some(expr) => parse_amenities(expr)?,
                None => Vec::new(),
            };
            Ok(Command::InsertRoom {
                spec: RoomSpec {
                    key: RoomKey::new(parse_string(&values[0])?, parse_u32(&values[1])?),
                    price: parse_price(&values[2])?,
                    currency: parse_string(&values[3])?.to_uppercase(),
                    capacity: parse_u32(&values[4])?,
                    beds: Beds {
                        single: parse_u32(&values[5])?,
                        double: parse_u32(&values[6])?,
                        king_size: parse_u32(&values[7])?,
                    },
                    amenities,
                },
            })
        }
        "photos" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("photos", 4, values.len()));
            }
            Ok(Command::InsertPhoto {
                resort: parse_string(&values[0])?,
                room: parse_u32(&values[1])?,
                photo: Photo {
                    position: parse_u32(&values[2])?,
                    url: parse_string(&values[3])?,
                },
            })
        }
        "reservations" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("reservations", 5, values.len()));
            }
            Ok(Command::InsertReservation {
                request: ReservationRequest {
                    resort: parse_string(&values[0])?,
                    room: parse_u32(&values[1])?,
                    start: parse_string(&values[2])?,
                    end: parse_string(&values[3])?,
                    payment_token: parse_string(&values[4])?,
                },
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "rooms" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = extract_filters(delete.selection.as_ref());
    Ok(Command::DeleteRoom {
        resort: parse_string(require(&filters, "resort")?)?,
        room: parse_u32(require(&filters, "number")?)?,
    })
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
    let filters = extract_filters(select.selection.as_ref());

    match table.as_str() {
        "rooms" => {
            let criteria = search_criteria(&filters)?;
            if is_count_projection(&select.projection) {
                Ok(Command::CountRooms { criteria })
            } else {
                Ok(Command::SelectRooms { criteria })
            }
        }
        "availability" => Ok(Command::SelectAvailability {
            resort: parse_string(require(&filters, "resort")?)?,
            room: parse_u32(require(&filters, "room")?)?,
            start: parse_string(require(&filters, "start_date")?)?,
            end: parse_string(require(&filters, "end_date")?)?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            resort: parse_string(require(&filters, "resort")?)?,
            room: parse_u32(require(&filters, "room")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn search_criteria(filters: &HashMap<String, &Expr>) -> Result<SearchCriteria, SqlError> {
    let optional_u32 = |col: &str| filters.get(col).map(|e| parse_u32(e)).transpose();
    Ok(SearchCriteria {
        location: parse_string(require(filters, "location")?)?,
        residents: parse_u32(require(filters, "residents")?)?,
        start: parse_string(require(filters, "start_date")?)?,
        end: parse_string(require(filters, "end_date")?)?,
        page: optional_u32("page")?,
        page_size: optional_u32("page_size")?,
        photos: optional_u32("photos")?.map(|n| n as usize),
    })
}

fn is_count_projection(projection: &[SelectItem]) -> bool {
    match projection.first() {
        Some(SelectItem::UnnamedExpr(Expr::Function(f)))
        | Some(SelectItem::ExprWithAlias { expr: Expr::Function(f), .. }) => {
            f.name.to_string().eq_ignore_ascii_case("count")
        }
        _ => false,
    }
}

/// Collect `column = value` pairs from an AND-chain. Other predicates are ignored.
fn extract_filters(selection: Option<&Expr>) -> HashMap<String, &Expr> {
    fn walk<'a>(expr: &'a Expr, out: &mut HashMap<String, &'a Expr>) {
        match expr {
            Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
                if let Some(col) = expr_column_name(left) {
                    out.insert(col, right.as_ref());
                }
            }
            Expr::Nested(inner) => walk(inner, out),
            _ => {}
        }
    }
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        walk(expr, &mut filters);
    }
    filters
}

fn require<'a>(filters: &HashMap<String, &'a Expr>, col: &'static str) -> Result<&'a Expr, SqlError> {
    filters.get(col).copied().ok_or(SqlError::MissingFilter(col))
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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
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

/// A string literal, or a number taken verbatim. Dates stay raw here.
fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
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

/// Major-unit decimal (`120`, `120.5`, `'120.50'`) to minor units.
fn parse_price(expr: &Expr) -> Result<Minor, SqlError> {
    let raw = parse_string(expr)?;
    let bad = || SqlError::Parse(format!("bad price: {raw:?}"));
    let (whole, frac) = raw.trim().split_once('.').unwrap_or((raw.trim(), ""));
    if whole.is_empty() || frac.len() > 2 || !whole.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    let whole: i64 = whole.parse().map_err(|_| bad())?;
    let cents: i64 = format!("{frac:0<2}").parse().map_err(|_| bad())?;
    whole
        .checked_mul(CURRENCY_MULTIPLIER)
        .and_then(|w| w.checked_add(cents))
        .ok_or_else(bad)
}

/// Comma-separated amenity names, or NULL for none.
fn parse_amenities(expr: &Expr) -> Result<Vec<RoomAmenity>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(Vec::new());
    }
    let raw = parse_string(expr)?;
    let mut amenities = Vec::new();
    for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
        let amenity: RoomAmenity = name.parse().map_err(SqlError::Parse)?;
        if !amenities.contains(&amenity) {
            amenities.push(amenity);
        }
    }
    amenities.sort();
    Ok(amenities)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
