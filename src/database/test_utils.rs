//! Database fixture for unit tests.

use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

use super::connection::get_database_url;
use super::migrations::Migrator;

/// Fresh in-memory SQLite database with the job and schema-cache tables.
pub async fn setup_test_db() -> DatabaseConnection {
    let db = Database::connect(get_database_url(Some(":memory:")))
        .await
        .unwrap_or_else(|e| panic!("in-memory database unavailable: {}", e));
    Migrator::up(&db, None)
        .await
        .unwrap_or_else(|e| panic!("migrations failed on a fresh database: {}", e));
    db
}

#[tokio::test]
async fn test_fixture_is_migrated() {
    use sea_orm::{ConnectionTrait, Statement};

    let db = setup_test_db().await;
    let row = db
        .query_one(Statement::from_string(
            db.get_database_backend(),
            "SELECT COUNT(*) AS n FROM background_jobs".to_string(),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<i64>("", "n").unwrap(), 0);
}
