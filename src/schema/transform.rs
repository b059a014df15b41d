//! Transform application.
//!
//! Applies a mapping's [`Transform`] to the value read from the remote record.
//! Failures never abort a record: the value becomes `null` and a warning is
//! returned with it.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use super::expression::{display, lookup_path, Expression};
use super::mapping::Transform;
use crate::errors::{ExpressionError, WriterResult};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.]*)\}").expect("placeholder regex"));

/// Field names referenced as `{field}` in a template.
pub fn template_placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Single-value reads backing `lookup` transforms.
#[async_trait]
pub trait LookupSource: Send + Sync {
    async fn lookup(
        &self,
        table: &str,
        match_column: &str,
        return_column: &str,
        value: &Value,
    ) -> WriterResult<Option<Value>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub value: Value,
    pub warning: Option<String>,
}

impl TransformOutcome {
    fn ok(value: Value) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    fn warn(message: String) -> Self {
        Self {
            value: Value::Null,
            warning: Some(message),
        }
    }
}

/// Applies transforms for one run, caching compiled formulas and lookups.
pub struct TransformEngine<'a> {
    lookups: Option<&'a dyn LookupSource>,
    formulas: HashMap<String, Result<Expression, ExpressionError>>,
    lookup_cache: HashMap<(String, String, String, String), Value>,
}

impl<'a> TransformEngine<'a> {
    pub fn new(lookups: Option<&'a dyn LookupSource>) -> Self {
        Self {
            lookups,
            formulas: HashMap::new(),
            lookup_cache: HashMap::new(),
        }
    }

    pub async fn apply(
        &mut self,
        transform: &Transform,
        current: Value,
        record: &Value,
    ) -> TransformOutcome {
        match transform {
            Transform::Default {
                value,
                only_if_null,
            } => {
                if *only_if_null && !current.is_null() {
                    TransformOutcome::ok(current)
                } else {
                    TransformOutcome::ok(value.clone())
                }
            }
            Transform::Coerce { target_type } => match coerce(&current, target_type) {
                Ok(value) => TransformOutcome::ok(value),
                Err(message) => TransformOutcome::warn(message),
            },
            Transform::Template { template } => {
                let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
                    let field = &caps[1];
                    if field == "value" {
                        display(&current)
                    } else {
                        display(&lookup_path(record, field))
                    }
                });
                TransformOutcome::ok(Value::String(rendered.into_owned()))
            }
            Transform::Expression { formula } => {
                let compiled = self
                    .formulas
                    .entry(formula.clone())
                    .or_insert_with(|| Expression::parse(formula));
                match compiled {
                    Ok(expression) => match expression.evaluate(record, &current) {
                        Ok(value) => TransformOutcome::ok(value),
                        Err(e) => TransformOutcome::warn(format!("Expression failed: {}", e)),
                    },
                    Err(e) => TransformOutcome::warn(format!("Invalid expression: {}", e)),
                }
            }
            Transform::Lookup {
                table,
                match_column,
                return_column,
            } => {
                if current.is_null() {
                    return TransformOutcome::ok(Value::Null);
                }
                let cache_key = (
                    table.clone(),
                    match_column.clone(),
                    return_column.clone(),
                    display(&current),
                );
                if let Some(hit) = self.lookup_cache.get(&cache_key) {
                    return TransformOutcome::ok(hit.clone());
                }
                let Some(source) = self.lookups else {
                    return TransformOutcome::warn(format!(
                        "No lookup source available for {}.{}",
                        table, match_column
                    ));
                };
                match source
                    .lookup(table, match_column, return_column, &current)
                    .await
                {
                    Ok(Some(found)) => {
                        self.lookup_cache.insert(cache_key, found.clone());
                        TransformOutcome::ok(found)
                    }
                    Ok(None) => {
                        debug!("Lookup miss in {} for {}", table, display(&current));
                        self.lookup_cache.insert(cache_key, Value::Null);
                        TransformOutcome::warn(format!(
                            "No {} row where {} = {}",
                            table,
                            match_column,
                            display(&current)
                        ))
                    }
                    Err(e) => TransformOutcome::warn(format!("Lookup failed: {}", e)),
                }
            }
        }
    }
}

/// Converts a value to one of the coerce target types.
pub fn coerce(value: &Value, target_type: &str) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let fail = || format!("Cannot coerce {} to {}", value, target_type);

    match target_type {
        "string" => Ok(Value::String(match value {
            Value::String(s) => s.clone(),
            other => display(other),
        })),
        "number" => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::Bool(b) => Ok(Value::from(if *b { 1 } else { 0 })),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    Ok(Value::from(i))
                } else {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .map(Value::Number)
                        .ok_or_else(fail)
                }
            }
            _ => Err(fail()),
        },
        "integer" => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
                .map(Value::from)
                .ok_or_else(fail),
            Value::Bool(b) => Ok(Value::from(if *b { 1 } else { 0 })),
            Value::String(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().map(|f| f.trunc() as i64))
                    .map(Value::from)
                    .ok_or_else(fail)
            }
            _ => Err(fail()),
        },
        "boolean" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "n" | "" => Ok(Value::Bool(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        "datetime" => match value {
            Value::String(s) => parse_datetime(s)
                .map(|dt| Value::String(dt.to_rfc3339()))
                .ok_or_else(fail),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                .map(|dt| Value::String(dt.to_rfc3339()))
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        "json" => match value {
            Value::String(s) => serde_json::from_str(s).map_err(|_| fail()),
            other => Ok(other.clone()),
        },
        _ => Err(format!("Unknown coerce target type '{}'", target_type)),
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
