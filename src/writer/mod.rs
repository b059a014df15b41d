//! Dialect-abstracted database writer.
//!
//! All writes go through [`DatabaseWriter`], which renders statements for the
//! connector's [`Dialect`] and executes them one chunk at a time. A chunk is a
//! single statement, so it either lands completely or not at all; a failed
//! chunk is recorded against every row it contained and the remaining chunks
//! still run.

pub mod connector;
pub mod dialect;
pub mod sql;
pub mod values;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use connector::{SeaOrmConnector, SqlConnector, SqlStatement};
pub use dialect::{Dialect, DialectFamily};

use crate::errors::{WriterError, WriterResult};
use crate::schema::transform::LookupSource;
use crate::services::mapping_validator::TypeCategory;
use crate::services::relational_schema::RelationalSchema;
use dialect::validate_identifier;
use sql::TimestampColumns;
use values::key_text;

/// One row to write: column name to value, in column order.
pub type Row = IndexMap<String, serde_json::Value>;

pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Update,
    Skip,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOptions {
    pub table: String,
    pub key_column: String,
    pub chunk_size: usize,
    pub on_conflict: ConflictPolicy,
    /// Look up existing keys first on dialects whose statements do not report
    /// per-row actions. Without it only an affected-row total is available.
    pub exact_counts: bool,
}

impl UpsertOptions {
    pub fn new(table: &str, key_column: &str) -> Self {
        Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            on_conflict: ConflictPolicy::Update,
            exact_counts: true,
        }
    }

    pub fn exact_counts(mut self, exact: bool) -> Self {
        self.exact_counts = exact;
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn on_conflict(mut self, policy: ConflictPolicy) -> Self {
        self.on_conflict = policy;
        self
    }
}

/// A row that was not written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    /// Index into the rows passed to the call
    pub index: usize,
    pub key: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertResult {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: Vec<RowError>,
    /// False when the dialect could only report an affected-row total
    pub counts_exact: bool,
}

impl UpsertResult {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn merge(&mut self, other: UpsertResult) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
        self.counts_exact &= other.counts_exact;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInsertResult {
    pub inserted: u64,
    pub errors: Vec<RowError>,
}

/// Column list shared by a set of rows, in order of first appearance.
pub fn collect_columns(rows: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for row in rows {
        for column in row.keys() {
            if seen.insert(column.as_str()) {
                columns.push(column.clone());
            }
        }
    }
    columns
}

#[derive(Clone)]
pub struct DatabaseWriter {
    connector: Arc<dyn SqlConnector>,
    /// Date and timestamp columns per table
    timestamp_columns: Arc<HashMap<String, TimestampColumns>>,
}

impl DatabaseWriter {
    pub fn new(connector: Arc<dyn SqlConnector>) -> Self {
        Self {
            connector,
            timestamp_columns: Arc::default(),
        }
    }

    /// Binds values for the date and timestamp columns of `schema` as native
    /// datetimes instead of text.
    pub fn with_column_types(mut self, schema: &RelationalSchema) -> Self {
        let mut timestamps = HashMap::new();
        for table in &schema.tables {
            let columns: TimestampColumns = table
                .columns
                .iter()
                .filter(|c| TypeCategory::from_sql_type(&c.data_type) == TypeCategory::Datetime)
                .map(|c| c.name.clone())
                .collect();
            if !columns.is_empty() {
                timestamps.insert(table.name.clone(), columns);
            }
        }
        self.timestamp_columns = Arc::new(timestamps);
        self
    }

    fn timestamps_for(&self, table: &str) -> Option<&TimestampColumns> {
        self.timestamp_columns.get(table)
    }

    pub fn for_connection(db: sea_orm::DatabaseConnection) -> Self {
        Self::new(Arc::new(SeaOrmConnector::new(db)))
    }

    pub fn dialect(&self) -> Dialect {
        self.connector.dialect()
    }

    /// Inserts or updates `rows` keyed by `options.key_column`.
    pub async fn upsert(&self, options: &UpsertOptions, rows: &[Row]) -> WriterResult<UpsertResult> {
        validate_identifier(&options.table)?;
        validate_identifier(&options.key_column)?;
        if options.chunk_size == 0 {
            return Err(WriterError::InvalidChunkSize(0));
        }

        let mut result = UpsertResult {
            counts_exact: true,
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(result);
        }

        let columns = collect_columns(rows);
        if !columns.contains(&options.key_column) {
            return Err(WriterError::MissingKey {
                index: 0,
                column: options.key_column.clone(),
            });
        }
        for column in &columns {
            validate_identifier(column)?;
        }

        for (chunk_index, chunk) in rows.chunks(options.chunk_size).enumerate() {
            let offset = chunk_index * options.chunk_size;
            let mut batch: Vec<(usize, &Row, String)> = Vec::with_capacity(chunk.len());
            for (i, row) in chunk.iter().enumerate() {
                match row.get(&options.key_column).and_then(key_text) {
                    Some(key) => batch.push((offset + i, row, key)),
                    None => result.errors.push(RowError {
                        index: offset + i,
                        key: None,
                        message: WriterError::MissingKey {
                            index: offset + i,
                            column: options.key_column.clone(),
                        }
                        .to_string(),
                    }),
                }
            }
            if batch.is_empty() {
                continue;
            }

            match self.upsert_chunk(options, &columns, &batch).await {
                Ok(chunk_result) => result.merge(chunk_result),
                Err(e) => {
                    warn!(
                        table = %options.table,
                        chunk = chunk_index,
                        rows = batch.len(),
                        "Upsert chunk failed: {}",
                        e
                    );
                    let message = e.to_string();
                    result
                        .errors
                        .extend(batch.iter().map(|(index, _, key)| RowError {
                            index: *index,
                            key: Some(key.clone()),
                            message: message.clone(),
                        }));
                }
            }
        }

        info!(
            table = %options.table,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.errors.len(),
            "Upsert finished"
        );
        Ok(result)
    }

    async fn upsert_chunk(
        &self,
        options: &UpsertOptions,
        columns: &[String],
        batch: &[(usize, &Row, String)],
    ) -> WriterResult<UpsertResult> {
        let dialect = self.dialect();
        let rows: Vec<&Row> = batch.iter().map(|(_, row, _)| *row).collect();
        let statement = sql::upsert(
            dialect,
            &options.table,
            &options.key_column,
            columns,
            &rows,
            options.on_conflict,
            self.timestamps_for(&options.table),
        )?;

        let reports_actions = matches!(dialect, Dialect::Postgres | Dialect::SqlServer);
        if reports_actions {
            let actions = self.connector.query_values(&statement).await?;
            let mut chunk = UpsertResult {
                counts_exact: true,
                ..Default::default()
            };
            for action in actions.iter().flatten() {
                if action.eq_ignore_ascii_case("UPDATE") {
                    chunk.updated += 1;
                } else {
                    chunk.inserted += 1;
                }
            }
            chunk.skipped = (batch.len() as u64).saturating_sub(chunk.written());
            return Ok(chunk);
        }

        if !options.exact_counts && options.on_conflict != ConflictPolicy::Error {
            let affected = self.connector.execute(&statement).await?;
            let written = affected.min(batch.len() as u64);
            return Ok(UpsertResult {
                inserted: written,
                skipped: batch.len() as u64 - written,
                counts_exact: false,
                ..Default::default()
            });
        }

        // No per-row action from the statement: classify keys beforehand.
        let existing = if options.on_conflict == ConflictPolicy::Error {
            HashSet::new()
        } else {
            let keys: Vec<String> = batch.iter().map(|(_, _, key)| key.clone()).collect();
            let lookup = sql::existing_keys(dialect, &options.table, &options.key_column, &keys)?;
            self.connector
                .query_values(&lookup)
                .await?
                .into_iter()
                .flatten()
                .collect::<HashSet<String>>()
        };

        let affected = self.connector.execute(&statement).await?;
        debug!(table = %options.table, affected, "Chunk written");

        let mut chunk = UpsertResult {
            counts_exact: true,
            ..Default::default()
        };
        let mut seen: HashSet<&str> = HashSet::new();
        for (_, _, key) in batch {
            let present = existing.contains(key) || !seen.insert(key.as_str());
            match (present, options.on_conflict) {
                (false, _) => chunk.inserted += 1,
                (true, ConflictPolicy::Update) => chunk.updated += 1,
                (true, _) => chunk.skipped += 1,
            }
        }
        Ok(chunk)
    }

    /// Inserts rows in chunks with no conflict handling.
    pub async fn batch_insert(
        &self,
        table: &str,
        rows: &[Row],
        chunk_size: usize,
    ) -> WriterResult<BatchInsertResult> {
        let dialect = self.dialect();
        validate_identifier(table)?;
        if chunk_size == 0 {
            return Err(WriterError::InvalidChunkSize(0));
        }
        let mut result = BatchInsertResult::default();
        if rows.is_empty() {
            return Ok(result);
        }
        let columns = collect_columns(rows);
        if columns.is_empty() {
            return Err(WriterError::EmptyColumns(table.to_string()));
        }

        for (chunk_index, chunk) in rows.chunks(chunk_size).enumerate() {
            let offset = chunk_index * chunk_size;
            let refs: Vec<&Row> = chunk.iter().collect();
            let statement = sql::insert(dialect, table, &columns, &refs, self.timestamps_for(table))?;
            match self.connector.execute(&statement).await {
                Ok(affected) => result.inserted += affected,
                Err(e) => {
                    warn!(table, chunk = chunk_index, "Insert chunk failed: {}", e);
                    let message = e.to_string();
                    result
                        .errors
                        .extend((offset..offset + chunk.len()).map(|index| RowError {
                            index,
                            key: None,
                            message: message.clone(),
                        }));
                }
            }
        }
        Ok(result)
    }

    /// Deletes rows whose key is not in `valid_keys`.
    ///
    /// An empty `valid_keys` deletes nothing: a sync that produced no records
    /// must never clear the table.
    pub async fn delete_stale(
        &self,
        table: &str,
        key_column: &str,
        valid_keys: &HashSet<String>,
    ) -> WriterResult<u64> {
        let dialect = self.dialect();
        if valid_keys.is_empty() {
            warn!(table, "Refusing stale delete with an empty key set");
            return Ok(0);
        }

        let existing = self
            .connector
            .query_values(&sql::all_keys(dialect, table, key_column)?)
            .await?;
        let stale: Vec<String> = existing
            .into_iter()
            .flatten()
            .filter(|key| !valid_keys.contains(key))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut deleted = 0;
        for chunk in stale.chunks(DEFAULT_CHUNK_SIZE) {
            let statement = sql::delete_keys(dialect, table, key_column, chunk)?;
            deleted += self.connector.execute(&statement).await?;
        }
        info!(table, deleted, "Deleted stale rows");
        Ok(deleted)
    }

    pub async fn update_by_key(
        &self,
        table: &str,
        key_column: &str,
        key: &serde_json::Value,
        values: &Row,
    ) -> WriterResult<u64> {
        let key = key_text(key).ok_or_else(|| WriterError::MissingKey {
            index: 0,
            column: key_column.to_string(),
        })?;
        if values.keys().all(|column| column == key_column) {
            return Err(WriterError::EmptyColumns(table.to_string()));
        }
        let statement = sql::update_by_key(
            self.dialect(),
            table,
            key_column,
            &key,
            values,
            self.timestamps_for(table),
        )?;
        self.connector.execute(&statement).await
    }

    pub async fn delete_by_key(
        &self,
        table: &str,
        key_column: &str,
        key: &serde_json::Value,
    ) -> WriterResult<u64> {
        let key = key_text(key).ok_or_else(|| WriterError::MissingKey {
            index: 0,
            column: key_column.to_string(),
        })?;
        let statement = sql::delete_by_key(self.dialect(), table, key_column, &key)?;
        self.connector.execute(&statement).await
    }

    /// Reads `return_column` of the first row whose `match_column` equals `value`.
    pub async fn lookup(
        &self,
        table: &str,
        match_column: &str,
        return_column: &str,
        value: &serde_json::Value,
    ) -> WriterResult<Option<serde_json::Value>> {
        let Some(needle) = key_text(value) else {
            return Ok(None);
        };
        let statement = sql::lookup(self.dialect(), table, match_column, return_column, &needle)?;
        let found = self.connector.query_values(&statement).await?;
        Ok(found
            .into_iter()
            .next()
            .map(|v| v.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null)))
    }
}

#[async_trait]
impl LookupSource for DatabaseWriter {
    async fn lookup(
        &self,
        table: &str,
        match_column: &str,
        return_column: &str,
        value: &serde_json::Value,
    ) -> WriterResult<Option<serde_json::Value>> {
        DatabaseWriter::lookup(self, table, match_column, return_column, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records statements and answers queries from a script.
    struct RecordingConnector {
        dialect: Dialect,
        statements: Mutex<Vec<SqlStatement>>,
        answers: Mutex<Vec<Vec<Option<String>>>>,
    }

    impl RecordingConnector {
        fn new(dialect: Dialect, answers: Vec<Vec<Option<String>>>) -> Self {
            Self {
                dialect,
                statements: Mutex::new(Vec::new()),
                answers: Mutex::new(answers),
            }
        }
    }

    #[async_trait]
    impl SqlConnector for RecordingConnector {
        fn dialect(&self) -> Dialect {
            self.dialect
        }

        async fn execute(&self, statement: &SqlStatement) -> WriterResult<u64> {
            self.statements.lock().unwrap().push(statement.clone());
            Ok(1)
        }

        async fn query_values(
            &self,
            statement: &SqlStatement,
        ) -> WriterResult<Vec<Option<String>>> {
            self.statements.lock().unwrap().push(statement.clone());
            let mut answers = self.answers.lock().unwrap();
            Ok(if answers.is_empty() {
                Vec::new()
            } else {
                answers.remove(0)
            })
        }
    }

    fn product(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("shopify_id".to_string(), json!(id));
        row.insert("title".to_string(), json!(format!("P{}", id)));
        row
    }

    #[tokio::test]
    async fn test_merge_output_counts() {
        let connector = Arc::new(RecordingConnector::new(
            Dialect::SqlServer,
            vec![vec![Some("INSERT".to_string()), Some("UPDATE".to_string())]],
        ));
        let writer = DatabaseWriter::new(connector.clone());
        let rows = vec![product(1), product(2), product(3)];
        let result = writer
            .upsert(
                &UpsertOptions::new("products", "shopify_id").on_conflict(ConflictPolicy::Skip),
                &rows,
            )
            .await
            .unwrap();
        assert_eq!((result.inserted, result.updated, result.skipped), (1, 1, 1));
        assert!(result.counts_exact);
        assert!(connector.statements.lock().unwrap()[0].sql.starts_with("MERGE INTO [products]"));
    }

    #[tokio::test]
    async fn test_mysql_precheck_counts() {
        let connector = Arc::new(RecordingConnector::new(
            Dialect::MySql,
            vec![vec![Some("2".to_string())]],
        ));
        let writer = DatabaseWriter::new(connector.clone());
        let rows = vec![product(1), product(2)];
        let result = writer
            .upsert(&UpsertOptions::new("products", "shopify_id"), &rows)
            .await
            .unwrap();
        assert_eq!((result.inserted, result.updated), (1, 1));

        let statements = connector.statements.lock().unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].sql.starts_with("SELECT CAST(`shopify_id` AS CHAR)"));
        assert!(statements[1].sql.contains("ON DUPLICATE KEY UPDATE"));
    }

    #[tokio::test]
    async fn test_totals_only_without_key_lookup() {
        let connector = Arc::new(RecordingConnector::new(Dialect::MySql, vec![]));
        let writer = DatabaseWriter::new(connector.clone());
        let rows = vec![product(1), product(2)];
        let result = writer
            .upsert(
                &UpsertOptions::new("products", "shopify_id").exact_counts(false),
                &rows,
            )
            .await
            .unwrap();
        assert!(!result.counts_exact);
        assert_eq!(result.inserted, 1);
        assert_eq!(connector.statements.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rows_without_key_are_reported() {
        let connector = Arc::new(RecordingConnector::new(Dialect::Sqlite, vec![]));
        let writer = DatabaseWriter::new(connector);
        let mut keyless = product(0);
        keyless.insert("shopify_id".to_string(), serde_json::Value::Null);
        let rows = vec![product(1), keyless];
        let result = writer
            .upsert(&UpsertOptions::new("products", "shopify_id"), &rows)
            .await
            .unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, 1);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let writer = DatabaseWriter::new(Arc::new(RecordingConnector::new(Dialect::Postgres, vec![])));
        let rows = vec![product(1)];
        assert!(matches!(
            writer
                .upsert(&UpsertOptions::new("products", "shopify_id").chunk_size(0), &rows)
                .await,
            Err(WriterError::InvalidChunkSize(0))
        ));
        assert!(matches!(
            writer
                .upsert(&UpsertOptions::new("products", "handle"), &rows)
                .await,
            Err(WriterError::MissingKey { .. })
        ));
        assert!(matches!(
            writer
                .upsert(&UpsertOptions::new("products;--", "shopify_id"), &rows)
                .await,
            Err(WriterError::InvalidIdentifier(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_stale_with_empty_set_issues_nothing() {
        let connector = Arc::new(RecordingConnector::new(Dialect::Postgres, vec![]));
        let writer = DatabaseWriter::new(connector.clone());
        let deleted = writer
            .delete_stale("products", "shopify_id", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(deleted, 0);
        assert!(connector.statements.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schema_datetime_columns_bind_natively() {
        use crate::services::relational_schema::{DatabaseColumn, DatabaseTable};

        let connector = Arc::new(RecordingConnector::new(Dialect::Postgres, vec![]));
        let schema = RelationalSchema::new(vec![DatabaseTable::new(
            "products",
            vec![
                DatabaseColumn::new("shopify_id", "text", false),
                DatabaseColumn::new("title", "varchar(255)", true),
                DatabaseColumn::new("published_at", "timestamp with time zone", true),
            ],
        )]);
        let writer = DatabaseWriter::new(connector.clone()).with_column_types(&schema);
        let mut row = product(1);
        row.insert("published_at".to_string(), json!("2024-05-01T10:00:00Z"));
        writer
            .upsert(&UpsertOptions::new("products", "shopify_id"), &[row])
            .await
            .unwrap();

        let statements = connector.statements.lock().unwrap();
        let values = &statements[0].values;
        assert!(matches!(values[1], sea_orm::Value::String(Some(_))));
        assert!(matches!(values[2], sea_orm::Value::ChronoDateTimeUtc(Some(_))));
    }

    #[test]
    fn test_collect_columns_union_in_order() {
        let mut a = Row::new();
        a.insert("id".to_string(), json!(1));
        a.insert("title".to_string(), json!("x"));
        let mut b = Row::new();
        b.insert("id".to_string(), json!(2));
        b.insert("vendor".to_string(), json!("v"));
        assert_eq!(
            collect_columns(&[a, b]),
            vec!["id".to_string(), "title".to_string(), "vendor".to_string()]
        );
    }
}
