#![allow(dead_code)]

use anyhow::Result;
use commerce_sync::database::migrations::Migrator;
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use sea_orm_migration::MigratorTrait;
use serde_json::Value;
use tempfile::NamedTempFile;

use commerce_sync::writer::Row;

/// File-backed SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<(DatabaseConnection, NamedTempFile)> {
    let temp_file = NamedTempFile::new()?;
    let db_url = format!("sqlite://{}?mode=rwc", temp_file.path().display());

    let db = Database::connect(&db_url).await?;
    Migrator::up(&db, None).await?;

    Ok((db, temp_file))
}

pub fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(column, value)| (column.to_string(), value.clone()))
        .collect()
}

pub async fn count(db: &DatabaseConnection, table: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            format!("SELECT COUNT(*) AS n FROM {}", table),
        ))
        .await?
        .expect("count row");
    Ok(row.try_get::<i64>("", "n")?)
}

pub async fn column_values(db: &DatabaseConnection, sql: &str) -> Result<Vec<String>> {
    let rows = db
        .query_all(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?;
    rows.iter()
        .map(|row| Ok(row.try_get::<String>("", "v")?))
        .collect()
}
