//! Dialect-specific statement construction.
//!
//! Identifiers are validated and quoted by [`Dialect::quote`]; every value is
//! bound through a placeholder except SQL `NULL`, which is written as a
//! literal so it takes its type from the target column.

use std::collections::HashSet;

use serde_json::Value as Json;

use super::connector::{SqlStatement, RESULT_COLUMN};
use super::dialect::{Dialect, DialectFamily};
use super::values::{to_sql_value, to_timestamp_value};
use super::{ConflictPolicy, Row};
use crate::errors::WriterResult;

/// Columns of the target table that hold dates or timestamps.
pub type TimestampColumns = HashSet<String>;

struct Binder<'a> {
    dialect: Dialect,
    timestamps: Option<&'a TimestampColumns>,
    values: Vec<sea_orm::Value>,
}

impl<'a> Binder<'a> {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            timestamps: None,
            values: Vec::new(),
        }
    }

    fn with_timestamps(dialect: Dialect, timestamps: Option<&'a TimestampColumns>) -> Self {
        Self {
            timestamps,
            ..Self::new(dialect)
        }
    }

    fn bind(&mut self, column: &str, value: &Json) -> String {
        if value.is_null() {
            return "NULL".to_string();
        }
        let is_timestamp = self.timestamps.map_or(false, |set| set.contains(column));
        let bound = if is_timestamp {
            to_timestamp_value(self.dialect, value)
        } else {
            to_sql_value(self.dialect, value)
        };
        self.values.push(bound);
        self.dialect.placeholder(self.values.len())
    }

    fn bind_text(&mut self, text: &str) -> String {
        self.values
            .push(sea_orm::Value::String(Some(Box::new(text.to_string()))));
        self.dialect.placeholder(self.values.len())
    }

    fn finish(self, sql: String) -> SqlStatement {
        SqlStatement::new(sql, self.values)
    }
}

fn quote_all(dialect: Dialect, columns: &[String]) -> WriterResult<Vec<String>> {
    columns.iter().map(|c| dialect.quote(c)).collect()
}

fn values_rows(binder: &mut Binder, columns: &[String], rows: &[&Row]) -> String {
    rows.iter()
        .map(|row| {
            let cells: Vec<String> = columns
                .iter()
                .map(|column| binder.bind(column, row.get(column).unwrap_or(&Json::Null)))
                .collect();
            format!("({})", cells.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Plain multi-row `INSERT`.
pub fn insert(
    dialect: Dialect,
    table: &str,
    columns: &[String],
    rows: &[&Row],
    timestamps: Option<&TimestampColumns>,
) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let quoted = quote_all(dialect, columns)?;
    let mut binder = Binder::with_timestamps(dialect, timestamps);
    let values = values_rows(&mut binder, columns, rows);
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quoted_table,
        quoted.join(", "),
        values
    );
    Ok(binder.finish(sql))
}

/// Upsert statement for one chunk.
///
/// Merge and on-conflict Postgres statements report one `sync_value` per
/// written row (`INSERT` or `UPDATE`); the other dialects return nothing.
pub fn upsert(
    dialect: Dialect,
    table: &str,
    key_column: &str,
    columns: &[String],
    rows: &[&Row],
    policy: ConflictPolicy,
    timestamps: Option<&TimestampColumns>,
) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let key = dialect.quote(key_column)?;
    let quoted = quote_all(dialect, columns)?;
    let updatable: Vec<&String> = quoted.iter().filter(|c| **c != key).collect();
    // A key-only table still needs an assignment to report the row as updated
    let assigned: Vec<&String> = if updatable.is_empty() {
        vec![&key]
    } else {
        updatable
    };

    let mut binder = Binder::with_timestamps(dialect, timestamps);
    let values = values_rows(&mut binder, columns, rows);
    let column_list = quoted.join(", ");

    let sql = match dialect.family() {
        DialectFamily::Merge => {
            let mut sql = format!(
                "MERGE INTO {table} WITH (HOLDLOCK) AS target USING (VALUES {values}) AS source ({columns}) ON target.{key} = source.{key}",
                table = quoted_table,
                values = values,
                columns = column_list,
                key = key,
            );
            match policy {
                ConflictPolicy::Update => {
                    let set = assigned
                        .iter()
                        .map(|c| format!("target.{c} = source.{c}", c = c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {}", set));
                }
                ConflictPolicy::Skip | ConflictPolicy::Error => {}
            }
            let source_columns = quoted
                .iter()
                .map(|c| format!("source.{}", c))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(
                " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({}) OUTPUT $action AS {};",
                column_list, source_columns, RESULT_COLUMN
            ));
            sql
        }
        DialectFamily::OnConflict => {
            let mut sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                quoted_table, column_list, values
            );
            let excluded = if dialect == Dialect::Postgres {
                "EXCLUDED"
            } else {
                "excluded"
            };
            match policy {
                ConflictPolicy::Update => {
                    let set = assigned
                        .iter()
                        .map(|c| format!("{c} = {x}.{c}", c = c, x = excluded))
                        .collect::<Vec<_>>()
                        .join(", ");
                    sql.push_str(&format!(" ON CONFLICT ({}) DO UPDATE SET {}", key, set));
                }
                ConflictPolicy::Skip => {
                    sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", key));
                }
                ConflictPolicy::Error => {}
            }
            if dialect == Dialect::Postgres {
                // xmax is zero only for tuples created by this statement
                sql.push_str(&format!(
                    " RETURNING CAST(CASE WHEN xmax = 0 THEN 'INSERT' ELSE 'UPDATE' END AS TEXT) AS {}",
                    RESULT_COLUMN
                ));
            }
            sql
        }
        DialectFamily::DuplicateKey => match policy {
            ConflictPolicy::Update => {
                let set = assigned
                    .iter()
                    .map(|c| format!("{c} = VALUES({c})", c = c))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
                    quoted_table, column_list, values, set
                )
            }
            ConflictPolicy::Skip => format!(
                "INSERT IGNORE INTO {} ({}) VALUES {}",
                quoted_table, column_list, values
            ),
            ConflictPolicy::Error => format!(
                "INSERT INTO {} ({}) VALUES {}",
                quoted_table, column_list, values
            ),
        },
    };

    Ok(binder.finish(sql))
}

/// Selects which of `keys` already exist, as text.
pub fn existing_keys(
    dialect: Dialect,
    table: &str,
    key_column: &str,
    keys: &[String],
) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let key = dialect.quote(key_column)?;
    let key_text = dialect.cast_to_text(&key);
    let mut binder = Binder::new(dialect);
    let placeholders: Vec<String> = keys.iter().map(|k| binder.bind_text(k)).collect();
    let sql = format!(
        "SELECT {kt} AS {alias} FROM {t} WHERE {kt} IN ({p})",
        kt = key_text,
        alias = RESULT_COLUMN,
        t = quoted_table,
        p = placeholders.join(", ")
    );
    Ok(binder.finish(sql))
}

/// Selects every key in the table, as text.
pub fn all_keys(dialect: Dialect, table: &str, key_column: &str) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let key = dialect.quote(key_column)?;
    Ok(SqlStatement::new(
        format!(
            "SELECT {} AS {} FROM {}",
            dialect.cast_to_text(&key),
            RESULT_COLUMN,
            quoted_table
        ),
        Vec::new(),
    ))
}

pub fn delete_keys(
    dialect: Dialect,
    table: &str,
    key_column: &str,
    keys: &[String],
) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let key = dialect.quote(key_column)?;
    let mut binder = Binder::new(dialect);
    let placeholders: Vec<String> = keys.iter().map(|k| binder.bind_text(k)).collect();
    let sql = format!(
        "DELETE FROM {} WHERE {} IN ({})",
        quoted_table,
        dialect.cast_to_text(&key),
        placeholders.join(", ")
    );
    Ok(binder.finish(sql))
}

pub fn update_by_key(
    dialect: Dialect,
    table: &str,
    key_column: &str,
    key_value: &str,
    values: &Row,
    timestamps: Option<&TimestampColumns>,
) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let key = dialect.quote(key_column)?;
    let mut binder = Binder::with_timestamps(dialect, timestamps);
    let mut assignments = Vec::new();
    for (column, value) in values.iter().filter(|(c, _)| c.as_str() != key_column) {
        let quoted = dialect.quote(column)?;
        assignments.push(format!("{} = {}", quoted, binder.bind(column, value)));
    }
    let key_placeholder = binder.bind_text(key_value);
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        quoted_table,
        assignments.join(", "),
        dialect.cast_to_text(&key),
        key_placeholder
    );
    Ok(binder.finish(sql))
}

pub fn delete_by_key(
    dialect: Dialect,
    table: &str,
    key_column: &str,
    key_value: &str,
) -> WriterResult<SqlStatement> {
    delete_keys(dialect, table, key_column, &[key_value.to_string()])
}

pub fn lookup(
    dialect: Dialect,
    table: &str,
    match_column: &str,
    return_column: &str,
    value: &str,
) -> WriterResult<SqlStatement> {
    let quoted_table = dialect.quote(table)?;
    let matched = dialect.quote(match_column)?;
    let returned = dialect.quote(return_column)?;
    let mut binder = Binder::new(dialect);
    let placeholder = binder.bind_text(value);
    let projection = format!("{} AS {}", dialect.cast_to_text(&returned), RESULT_COLUMN);
    let filter = format!("{} = {}", dialect.cast_to_text(&matched), placeholder);
    let sql = if dialect == Dialect::SqlServer {
        format!(
            "SELECT TOP 1 {} FROM {} WHERE {}",
            projection, quoted_table, filter
        )
    } else {
        format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            projection, quoted_table, filter
        )
    };
    Ok(binder.finish(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, title: &str) -> Row {
        let mut row = Row::new();
        row.insert("shopify_id".to_string(), json!(id));
        row.insert("title".to_string(), json!(title));
        row
    }

    fn columns() -> Vec<String> {
        vec!["shopify_id".to_string(), "title".to_string()]
    }

    #[test]
    fn test_postgres_upsert_returns_action() {
        let rows = [row(1, "a"), row(2, "b")];
        let refs: Vec<&Row> = rows.iter().collect();
        let stmt = upsert(
            Dialect::Postgres,
            "products",
            "shopify_id",
            &columns(),
            &refs,
            ConflictPolicy::Update,
            None,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"products\" (\"shopify_id\", \"title\") VALUES ($1, $2), ($3, $4) \
             ON CONFLICT (\"shopify_id\") DO UPDATE SET \"title\" = EXCLUDED.\"title\" \
             RETURNING CAST(CASE WHEN xmax = 0 THEN 'INSERT' ELSE 'UPDATE' END AS TEXT) AS sync_value"
        );
        assert_eq!(stmt.values.len(), 4);
    }

    #[test]
    fn test_sqlserver_merge() {
        let rows = [row(1, "a")];
        let refs: Vec<&Row> = rows.iter().collect();
        let stmt = upsert(
            Dialect::SqlServer,
            "dbo.products",
            "shopify_id",
            &columns(),
            &refs,
            ConflictPolicy::Update,
            None,
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "MERGE INTO [dbo].[products] WITH (HOLDLOCK) AS target \
             USING (VALUES (@P1, @P2)) AS source ([shopify_id], [title]) \
             ON target.[shopify_id] = source.[shopify_id] \
             WHEN MATCHED THEN UPDATE SET target.[title] = source.[title] \
             WHEN NOT MATCHED THEN INSERT ([shopify_id], [title]) VALUES (source.[shopify_id], source.[title]) \
             OUTPUT $action AS sync_value;"
        );

        let skip = upsert(
            Dialect::SqlServer,
            "products",
            "shopify_id",
            &columns(),
            &refs,
            ConflictPolicy::Skip,
            None,
        )
        .unwrap();
        assert!(!skip.sql.contains("WHEN MATCHED"));
    }

    #[test]
    fn test_mysql_variants() {
        let rows = [row(1, "a")];
        let refs: Vec<&Row> = rows.iter().collect();
        let update = upsert(
            Dialect::MySql,
            "products",
            "shopify_id",
            &columns(),
            &refs,
            ConflictPolicy::Update,
            None,
        )
        .unwrap();
        assert_eq!(
            update.sql,
            "INSERT INTO `products` (`shopify_id`, `title`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `title` = VALUES(`title`)"
        );
        let skip = upsert(
            Dialect::MySql,
            "products",
            "shopify_id",
            &columns(),
            &refs,
            ConflictPolicy::Skip,
            None,
        )
        .unwrap();
        assert!(skip.sql.starts_with("INSERT IGNORE INTO `products`"));
    }

    #[test]
    fn test_nulls_are_literals() {
        let mut r = row(1, "a");
        r.insert("title".to_string(), Json::Null);
        let stmt = insert(Dialect::Postgres, "products", &columns(), &[&r], None).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"products\" (\"shopify_id\", \"title\") VALUES ($1, NULL)"
        );
        assert_eq!(stmt.values.len(), 1);
    }

    #[test]
    fn test_key_only_upsert_assigns_key() {
        let mut r = Row::new();
        r.insert("shopify_id".to_string(), json!(5));
        let stmt = upsert(
            Dialect::Sqlite,
            "tags",
            "shopify_id",
            &["shopify_id".to_string()],
            &[&r],
            ConflictPolicy::Update,
            None,
        )
        .unwrap();
        assert!(stmt
            .sql
            .ends_with("ON CONFLICT (\"shopify_id\") DO UPDATE SET \"shopify_id\" = excluded.\"shopify_id\""));
    }

    #[test]
    fn test_single_record_statements() {
        let mut values = Row::new();
        values.insert("shopify_id".to_string(), json!(9));
        values.insert("title".to_string(), json!("x"));
        let update = update_by_key(Dialect::Postgres, "products", "shopify_id", "9", &values, None).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE \"products\" SET \"title\" = $1 WHERE CAST(\"shopify_id\" AS TEXT) = $2"
        );

        let delete = delete_by_key(Dialect::MySql, "products", "shopify_id", "9").unwrap();
        assert_eq!(
            delete.sql,
            "DELETE FROM `products` WHERE CAST(`shopify_id` AS CHAR) IN (?)"
        );

        let lookup = lookup(Dialect::SqlServer, "vendors", "name", "id", "Acme").unwrap();
        assert_eq!(
            lookup.sql,
            "SELECT TOP 1 CAST([id] AS NVARCHAR(MAX)) AS sync_value FROM [vendors] WHERE CAST([name] AS NVARCHAR(MAX)) = @P1"
        );
    }

    #[test]
    fn test_identifiers_are_validated() {
        let r = row(1, "a");
        assert!(insert(Dialect::Sqlite, "products; drop table x", &columns(), &[&r], None).is_err());
        assert!(insert(
            Dialect::Sqlite,
            "products",
            &["title\"--".to_string()],
            &[&r],
            None
        )
        .is_err());
    }

    #[test]
    fn test_timestamp_columns_bind_as_datetimes() {
        let mut r = row(1, "2024-05-01T10:00:00Z");
        r.insert("published_at".to_string(), json!("2024-05-01T10:00:00Z"));
        let cols = vec![
            "shopify_id".to_string(),
            "title".to_string(),
            "published_at".to_string(),
        ];
        let timestamps: TimestampColumns = ["published_at".to_string()].into_iter().collect();

        let stmt = insert(Dialect::Postgres, "products", &cols, &[&r], Some(&timestamps)).unwrap();
        assert!(matches!(stmt.values[1], sea_orm::Value::String(Some(_))));
        assert!(matches!(stmt.values[2], sea_orm::Value::ChronoDateTimeUtc(Some(_))));

        let update = update_by_key(
            Dialect::MySql,
            "products",
            "shopify_id",
            "1",
            &r,
            Some(&timestamps),
        )
        .unwrap();
        assert!(update
            .values
            .iter()
            .any(|v| matches!(v, sea_orm::Value::ChronoDateTimeUtc(Some(_)))));

        let plain = insert(Dialect::Postgres, "products", &cols, &[&r], None).unwrap();
        assert!(plain
            .values
            .iter()
            .all(|v| !matches!(v, sea_orm::Value::ChronoDateTimeUtc(_))));
    }
}
