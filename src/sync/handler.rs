use anyhow::{Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use super::mapper::{select_mappings, RecordMapper};
use super::source::RemoteRecordSource;
use super::webhook::WebhookApplier;
use crate::jobs::{JobArtifact, JobContext, JobFamily, JobHandler, SyncPayload, SyncRequest, WebhookPayload};
use crate::schema::{find_entity, LookupSource};
use crate::services::{RelationalSchema, SchemaCacheService};
use crate::writer::values::key_text;
use crate::writer::{DatabaseWriter, Row, UpsertOptions, UpsertResult, DEFAULT_CHUNK_SIZE};

/// Progress for page `n` when the total is unknown: rises towards 90.
fn page_percent(pages: usize) -> i32 {
    (90 - 90 / (pages as i32 + 1)).clamp(5, 90)
}

/// Runs entity syncs and webhook deliveries for the `sync` job family.
pub struct SyncJobHandler {
    cache: SchemaCacheService,
    writer: DatabaseWriter,
    source: Arc<dyn RemoteRecordSource>,
    relational: Option<RelationalSchema>,
    chunk_size: usize,
    webhooks: WebhookApplier,
}

impl SyncJobHandler {
    pub fn new(
        cache: SchemaCacheService,
        writer: DatabaseWriter,
        source: Arc<dyn RemoteRecordSource>,
    ) -> Self {
        Self {
            webhooks: WebhookApplier::new(cache.clone(), writer.clone()),
            cache,
            writer,
            source,
            relational: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Target schema used to validate mappings before a run and to type the
    /// bound values of its date columns.
    pub fn with_relational_schema(mut self, schema: RelationalSchema) -> Self {
        self.writer = self.writer.with_column_types(&schema);
        self.webhooks = self.webhooks.with_relational_schema(schema.clone());
        self.relational = Some(schema);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn sync_entity(&self, ctx: &JobContext, request: &SyncPayload) -> Result<()> {
        let entity = find_entity(&request.entity_type)
            .with_context(|| format!("Unknown entity type {}", request.entity_type))?;
        if !ctx
            .progress
            .update("loading mappings", Some(entity.name), 0, None)
            .await?
        {
            return Ok(());
        }

        let selection = select_mappings(
            &self.cache,
            &request.connection_id,
            entity.name,
            self.relational.as_ref(),
        )
        .await?;
        for (full_path, reasons) in &selection.rejected {
            warn!(
                "[{}] Skipping mapping {}: {}",
                ctx.job_id,
                full_path,
                reasons.join("; ")
            );
        }
        let skipped_mappings = selection.rejected_paths();

        let lookups: &dyn LookupSource = &self.writer;
        let mut mapper = RecordMapper::new(&selection.usable, Some(lookups));
        if mapper.is_empty() {
            anyhow::bail!("No valid mappings for {}", entity.name);
        }
        let keys = mapper.key_columns();
        for table in mapper.tables() {
            if !keys.contains_key(&table) {
                warn!("[{}] Table {} has no key mapping, not written", ctx.job_id, table);
            }
        }
        if keys.is_empty() {
            anyhow::bail!("No key mapping configured for {}", entity.name);
        }
        let fields = mapper.source_paths();

        let mut totals: IndexMap<String, UpsertResult> = keys
            .keys()
            .map(|table| {
                (
                    table.clone(),
                    UpsertResult {
                        counts_exact: true,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
        let mut fetched = 0usize;
        let mut warnings = 0usize;
        let mut pages = 0usize;
        let mut cursor: Option<String> = None;

        let metrics = |fetched: usize, warnings: usize, totals: &IndexMap<String, UpsertResult>| {
            json!({
                "fetched": fetched,
                "inserted": totals.values().map(|r| r.inserted).sum::<u64>(),
                "updated": totals.values().map(|r| r.updated).sum::<u64>(),
                "skipped": totals.values().map(|r| r.skipped).sum::<u64>(),
                "errors": totals.values().map(|r| r.errors.len()).sum::<usize>(),
                "warnings": warnings,
                "skippedMappings": skipped_mappings,
            })
        };

        loop {
            if ctx.progress.check_cancelled().await? {
                return Ok(());
            }
            let page = self
                .source
                .fetch_page(entity, &fields, cursor.as_deref())
                .await?;
            // A page fetched after cancellation is dropped unwritten
            if ctx.progress.check_cancelled().await? {
                return Ok(());
            }
            pages += 1;
            fetched += page.records.len();

            let mut batches: IndexMap<&str, Vec<Row>> = IndexMap::new();
            for record in &page.records {
                let mapped = mapper.map_record(record).await;
                warnings += mapped.warnings.len();
                for (table, row) in mapped.rows {
                    if let Some((table, _)) = keys.get_key_value(&table) {
                        batches.entry(table.as_str()).or_default().push(row);
                    }
                }
            }

            for (table, rows) in batches {
                let key_column = &keys[table];
                let options = UpsertOptions::new(table, key_column).chunk_size(self.chunk_size);
                let result = self.writer.upsert(&options, &rows).await?;
                if !result.errors.is_empty() {
                    warn!(
                        "[{}] {} rows failed for {}",
                        ctx.job_id,
                        result.errors.len(),
                        table
                    );
                }
                let table_seen = seen.entry(table.to_string()).or_default();
                table_seen.extend(rows.iter().filter_map(|row| row.get(key_column).and_then(key_text)));
                if let Some(total) = totals.get_mut(table) {
                    total.merge(result);
                }
            }

            let detail = format!("page {}, {} records", pages, fetched);
            if !ctx
                .progress
                .update(
                    "syncing",
                    Some(detail.as_str()),
                    page_percent(pages),
                    Some(metrics(fetched, warnings, &totals)),
                )
                .await?
            {
                return Ok(());
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        let mut deleted = 0u64;
        if request.delete_stale {
            if fetched == 0 {
                warn!(
                    "[{}] No records fetched for {}, skipping stale delete",
                    ctx.job_id, entity.name
                );
            } else {
                if !ctx
                    .progress
                    .update("deleting stale rows", None, 95, None)
                    .await?
                {
                    return Ok(());
                }
                for (table, key_column) in &keys {
                    if let Some(valid) = seen.get(table) {
                        deleted += self.writer.delete_stale(table, key_column, valid).await?;
                    }
                }
            }
        }

        let mut summary = metrics(fetched, warnings, &totals);
        summary["deleted"] = json!(deleted);
        summary["tables"] = json!(totals);
        ctx.progress
            .update("completed", None, 100, Some(summary))
            .await?;
        info!(
            "[{}] Synced {} {} records in {} pages ({} stale rows deleted)",
            ctx.job_id, fetched, entity.name, pages, deleted
        );
        Ok(())
    }

    async fn apply_webhook(&self, ctx: &JobContext, request: &WebhookPayload) -> Result<()> {
        if !ctx
            .progress
            .update("applying webhook", Some(request.topic.as_str()), 10, None)
            .await?
        {
            return Ok(());
        }
        let outcome = self
            .webhooks
            .apply(&request.connection_id, &request.topic, &request.payload)
            .await?;
        ctx.progress
            .update("completed", None, 100, Some(serde_json::to_value(&outcome)?))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    fn family(&self) -> JobFamily {
        JobFamily::Sync
    }

    async fn run(&self, ctx: &JobContext) -> Result<Option<JobArtifact>> {
        match ctx.payload::<SyncRequest>()? {
            SyncRequest::Entity(request) => self.sync_entity(ctx, &request).await?,
            SyncRequest::Webhook(request) => self.apply_webhook(ctx, &request).await?,
        }
        Ok(None)
    }
}
