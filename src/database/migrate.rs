use anyhow::Result;
use clap::Subcommand;
use sea_orm_migration::MigratorTrait;
use tracing::info;

use super::connection::establish_connection;
use super::migrations::Migrator;
use crate::config::DatabaseConfig;

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateDirection {
    Up,
    Down,
    /// Down then up
    Fresh,
}

pub async fn migrate_database(config: &DatabaseConfig, direction: MigrateDirection) -> Result<()> {
    let db = establish_connection(config).await?;

    match direction {
        MigrateDirection::Up => {
            info!("Running migrations up");
            Migrator::up(&db, None).await?;
        }
        MigrateDirection::Down => {
            info!("Running migrations down");
            Migrator::down(&db, None).await?;
        }
        MigrateDirection::Fresh => {
            info!("Running fresh migrations (down then up)");
            Migrator::down(&db, None).await?;
            Migrator::up(&db, None).await?;
        }
    }

    info!("Database migration completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::ConnectionTrait;

    #[tokio::test]
    async fn test_fresh_migration_on_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: dir.path().join("sync.db").display().to_string(),
            ..Default::default()
        };

        migrate_database(&config, MigrateDirection::Up).await.unwrap();
        migrate_database(&config, MigrateDirection::Fresh).await.unwrap();

        let db = establish_connection(&config).await.unwrap();
        db.execute_unprepared("SELECT id FROM background_jobs")
            .await
            .unwrap();
    }
}
