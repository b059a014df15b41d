//! Conversion of JSON row values into bound statement parameters.

use sea_orm::Value;
use serde_json::Value as Json;

use super::dialect::Dialect;
use crate::schema::transform::parse_datetime;

/// Converts one JSON cell into a bound value for `dialect`.
///
/// Booleans and numbers bind natively and strings bind as text, whatever they
/// look like. Objects and arrays bind as JSON on Postgres and as serialized
/// text elsewhere. Columns known to hold timestamps go through
/// [`to_timestamp_value`] instead.
pub fn to_sql_value(dialect: Dialect, value: &Json) -> Value {
    match value {
        Json::Null => Value::String(None),
        Json::Bool(b) => Value::Bool(Some(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(Some(i))
            } else if let Some(f) = n.as_f64() {
                Value::Double(Some(f))
            } else {
                Value::String(Some(Box::new(n.to_string())))
            }
        }
        Json::String(s) => Value::String(Some(Box::new(s.clone()))),
        Json::Array(_) | Json::Object(_) => {
            if dialect.supports_native_json() {
                Value::Json(Some(Box::new(value.clone())))
            } else {
                Value::String(Some(Box::new(value.to_string())))
            }
        }
    }
}

/// Binds a cell destined for a date or timestamp column.
///
/// Parseable strings become native timestamps on servers with a datetime
/// type. SQLite stores dates as text, so it keeps the string as written.
pub fn to_timestamp_value(dialect: Dialect, value: &Json) -> Value {
    if dialect != Dialect::Sqlite {
        if let Some(dt) = value.as_str().and_then(parse_datetime) {
            return Value::ChronoDateTimeUtc(Some(Box::new(dt)));
        }
    }
    to_sql_value(dialect, value)
}

/// Key values are compared as text so numeric and string keys behave alike.
pub fn key_text(value: &Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}
