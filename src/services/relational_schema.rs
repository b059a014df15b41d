//! Discovery of the target database's tables and columns.
//!
//! Used only by mapping validation; the writer never consults it.

use once_cell::sync::Lazy;
use regex::Regex;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, DbErr, QueryResult, Statement};
use serde::{Deserialize, Serialize};
use tracing::debug;

static LENGTH_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*(\d+)\s*(?:,\s*\d+\s*)?\)").expect("valid length regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    /// Declared character length; `None` for unbounded or non-text columns
    #[serde(default)]
    pub max_length: Option<i64>,
}

impl DatabaseColumn {
    pub fn new(name: &str, data_type: &str, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
            max_length: parse_max_length(data_type),
        }
    }

    pub fn with_max_length(mut self, max_length: i64) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTable {
    pub name: String,
    pub columns: Vec<DatabaseColumn>,
}

impl DatabaseTable {
    pub fn new(name: &str, columns: Vec<DatabaseColumn>) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }

    pub fn find_column(&self, name: &str) -> Option<&DatabaseColumn> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalSchema {
    pub tables: Vec<DatabaseTable>,
}

impl RelationalSchema {
    pub fn new(tables: Vec<DatabaseTable>) -> Self {
        Self { tables }
    }

    pub fn find_table(&self, name: &str) -> Option<&DatabaseTable> {
        self.tables
            .iter()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    pub fn find_column(&self, table: &str, column: &str) -> Option<&DatabaseColumn> {
        self.find_table(table)?.find_column(column)
    }
}

/// `VARCHAR(255)` -> 255. Precision/scale pairs report the precision.
pub fn parse_max_length(data_type: &str) -> Option<i64> {
    LENGTH_SUFFIX
        .captures(data_type)
        .and_then(|captures| captures.get(1))
        .and_then(|length| length.as_str().parse().ok())
}

const POSTGRES_COLUMNS: &str = "SELECT table_name AS table_name, column_name AS column_name, \
     data_type AS data_type, is_nullable AS is_nullable, \
     CAST(character_maximum_length AS BIGINT) AS max_length \
     FROM information_schema.columns WHERE table_schema = current_schema() \
     ORDER BY table_name, ordinal_position";

const MYSQL_COLUMNS: &str = "SELECT table_name AS table_name, column_name AS column_name, \
     data_type AS data_type, is_nullable AS is_nullable, \
     CAST(character_maximum_length AS SIGNED) AS max_length \
     FROM information_schema.columns WHERE table_schema = DATABASE() \
     ORDER BY table_name, ordinal_position";

const SQLITE_COLUMNS: &str = "SELECT m.name AS table_name, p.name AS column_name, \
     p.type AS data_type, p.\"notnull\" AS not_null \
     FROM sqlite_master m JOIN pragma_table_info(m.name) p \
     WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' \
     ORDER BY m.name, p.cid";

/// Reads every table and column of the connection's current schema.
pub async fn discover(db: &DatabaseConnection) -> Result<RelationalSchema, DbErr> {
    let backend = db.get_database_backend();
    let sql = match backend {
        DbBackend::Postgres => POSTGRES_COLUMNS,
        DbBackend::MySql => MYSQL_COLUMNS,
        DbBackend::Sqlite => SQLITE_COLUMNS,
    };
    let rows = db
        .query_all(Statement::from_string(backend, sql.to_string()))
        .await?;

    let mut tables: Vec<DatabaseTable> = Vec::new();
    for row in rows {
        let table_name: String = row.try_get("", "table_name")?;
        let column = column_from_row(backend, &row)?;
        match tables.last_mut() {
            Some(table) if table.name == table_name => table.columns.push(column),
            _ => tables.push(DatabaseTable::new(&table_name, vec![column])),
        }
    }

    debug!("Discovered {} tables on {:?}", tables.len(), backend);
    Ok(RelationalSchema::new(tables))
}

fn column_from_row(backend: DbBackend, row: &QueryResult) -> Result<DatabaseColumn, DbErr> {
    let name: String = row.try_get("", "column_name")?;
    let data_type: String = row.try_get("", "data_type")?;

    let column = match backend {
        DbBackend::Sqlite => {
            let not_null: i64 = row.try_get("", "not_null")?;
            DatabaseColumn::new(&name, &data_type, not_null == 0)
        }
        DbBackend::Postgres | DbBackend::MySql => {
            let is_nullable: String = row.try_get("", "is_nullable")?;
            let max_length: Option<i64> = row.try_get("", "max_length")?;
            DatabaseColumn {
                name,
                data_type,
                nullable: is_nullable.eq_ignore_ascii_case("YES"),
                max_length,
            }
        }
    };
    Ok(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_utils::setup_test_db;

    #[test]
    fn test_parse_max_length() {
        assert_eq!(parse_max_length("VARCHAR(255)"), Some(255));
        assert_eq!(parse_max_length("numeric(10, 2)"), Some(10));
        assert_eq!(parse_max_length("TEXT"), None);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let schema = RelationalSchema::new(vec![DatabaseTable::new(
            "Products",
            vec![DatabaseColumn::new("Title", "varchar(80)", true)],
        )]);
        let column = schema.find_column("products", "TITLE").unwrap();
        assert_eq!(column.max_length, Some(80));
        assert!(schema.find_column("products", "handle").is_none());
        assert!(schema.find_table("orders").is_none());
    }

    #[tokio::test]
    async fn test_discover_sqlite_tables() {
        let db = setup_test_db().await;
        db.execute(Statement::from_string(
            DbBackend::Sqlite,
            "CREATE TABLE products (id TEXT NOT NULL PRIMARY KEY, title VARCHAR(40), price REAL)"
                .to_string(),
        ))
        .await
        .unwrap();

        let schema = discover(&db).await.unwrap();
        let products = schema.find_table("products").unwrap();
        assert_eq!(products.columns.len(), 3);
        assert!(!products.find_column("id").unwrap().nullable);

        let title = products.find_column("title").unwrap();
        assert!(title.nullable);
        assert_eq!(title.max_length, Some(40));

        assert!(schema.find_column("background_jobs", "status").is_some());
    }
}
