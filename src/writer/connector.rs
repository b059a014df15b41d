use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement, Value};
use tracing::debug;

use super::dialect::Dialect;
use crate::errors::WriterResult;

/// Column alias every query issued by the writer projects its result into.
pub const RESULT_COLUMN: &str = "sync_value";

/// A statement with its bound parameters, already rendered for one dialect.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub values: Vec<Value>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            values,
        }
    }
}

/// Executes writer statements against one target database.
///
/// Queries always project a single text column aliased `sync_value`, so a
/// connector only needs to return that column for each row.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Returns the number of affected rows.
    async fn execute(&self, statement: &SqlStatement) -> WriterResult<u64>;

    async fn query_values(&self, statement: &SqlStatement) -> WriterResult<Vec<Option<String>>>;
}

/// Postgres, MySQL and SQLite targets through sea-orm.
#[derive(Clone)]
pub struct SeaOrmConnector {
    db: DatabaseConnection,
    dialect: Dialect,
}

impl SeaOrmConnector {
    pub fn new(db: DatabaseConnection) -> Self {
        let dialect = Dialect::from_backend(db.get_database_backend());
        Self { db, dialect }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn statement(&self, statement: &SqlStatement) -> Statement {
        Statement::from_sql_and_values(
            self.db.get_database_backend(),
            statement.sql.clone(),
            statement.values.clone(),
        )
    }
}

#[async_trait]
impl SqlConnector for SeaOrmConnector {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, statement: &SqlStatement) -> WriterResult<u64> {
        debug!(dialect = %self.dialect, params = statement.values.len(), "execute");
        let result = self.db.execute(self.statement(statement)).await?;
        Ok(result.rows_affected())
    }

    async fn query_values(&self, statement: &SqlStatement) -> WriterResult<Vec<Option<String>>> {
        debug!(dialect = %self.dialect, params = statement.values.len(), "query");
        let rows = self.db.query_all(self.statement(statement)).await?;
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(row.try_get::<Option<String>>("", RESULT_COLUMN)?);
        }
        Ok(values)
    }
}
