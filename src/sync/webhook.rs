use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::mapper::{select_mappings, RecordMapper};
use crate::schema::catalog::entity_for_topic;
use crate::schema::LookupSource;
use crate::services::{RelationalSchema, SchemaCacheService};
use crate::writer::{ConflictPolicy, DatabaseWriter, UpsertOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAction {
    Create,
    Update,
    Delete,
}

impl WebhookAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(WebhookAction::Create),
            "update" => Some(WebhookAction::Update),
            "delete" => Some(WebhookAction::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableChange {
    pub table: String,
    pub affected: u64,
    /// Update found no row and the record was inserted instead
    pub inserted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub entity_type: String,
    pub action: WebhookAction,
    pub changes: Vec<TableChange>,
    pub warnings: Vec<String>,
}

/// Rewrites a REST-style webhook body for `entity` into the record shape the
/// mappings read: camelCase keys, `id` as a global id and the numeric id kept
/// as `legacyResourceId`.
///
/// The global id comes from `admin_graphql_api_id`; deletion bodies carry
/// only the numeric id, so it is built as `gid://shopify/<entity>/<id>`.
pub fn normalize_payload(payload: &Value, entity: &str) -> Value {
    fn camel(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        let mut upper = false;
        for c in key.chars() {
            if c == '_' {
                upper = true;
            } else if upper {
                out.extend(c.to_uppercase());
                upper = false;
            } else {
                out.push(c);
            }
        }
        out
    }

    fn convert(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (camel(k), convert(v)))
                    .collect::<Map<_, _>>(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(convert).collect()),
            other => other.clone(),
        }
    }

    fn numeric_id(value: &Value) -> Option<String> {
        match value {
            Value::Number(n) if n.is_u64() => Some(n.to_string()),
            Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                Some(s.clone())
            }
            _ => None,
        }
    }

    let mut record = convert(payload);
    if let Some(object) = record.as_object_mut() {
        let gid = match object.remove("adminGraphqlApiId") {
            Some(gid) => Some(gid),
            None => object
                .get("id")
                .and_then(numeric_id)
                .map(|id| Value::String(format!("gid://shopify/{}/{}", entity, id))),
        };
        if let Some(gid) = gid {
            if let Some(legacy) = object.remove("id") {
                object.insert("legacyResourceId".to_string(), legacy);
            }
            object.insert("id".to_string(), gid);
        }
    }
    record
}

/// Applies single-record webhook deliveries to the mapped tables.
pub struct WebhookApplier {
    cache: SchemaCacheService,
    writer: DatabaseWriter,
    relational: Option<RelationalSchema>,
}

impl WebhookApplier {
    pub fn new(cache: SchemaCacheService, writer: DatabaseWriter) -> Self {
        Self {
            cache,
            writer,
            relational: None,
        }
    }

    /// Mappings that fail validation against `schema` are not applied.
    pub fn with_relational_schema(mut self, schema: RelationalSchema) -> Self {
        self.writer = self.writer.with_column_types(&schema);
        self.relational = Some(schema);
        self
    }

    /// `topic` is `<resource>/<action>`, e.g. `products/update`.
    pub async fn apply(
        &self,
        connection_id: &str,
        topic: &str,
        payload: &Value,
    ) -> Result<WebhookOutcome> {
        let (resource, action) = topic
            .split_once('/')
            .with_context(|| format!("Malformed webhook topic '{}'", topic))?;
        let entity = entity_for_topic(resource)
            .with_context(|| format!("No entity handles webhook topic '{}'", topic))?;
        let Some(action) = WebhookAction::parse(action) else {
            bail!("Unsupported webhook action in '{}'", topic);
        };

        let selection = select_mappings(
            &self.cache,
            connection_id,
            entity.name,
            self.relational.as_ref(),
        )
        .await?;
        let lookups: &dyn LookupSource = &self.writer;
        let mut mapper = RecordMapper::new(&selection.usable, Some(lookups));
        let keys = mapper.key_columns();
        if keys.is_empty() {
            bail!("No key mapping configured for {}", entity.name);
        }

        let record = normalize_payload(payload, entity.name);
        let mapped = mapper.map_record(&record).await;
        let mut outcome = WebhookOutcome {
            entity_type: entity.name.to_string(),
            action,
            changes: Vec::new(),
            warnings: mapped.warnings,
        };
        outcome.warnings.extend(
            selection
                .rejected_paths()
                .into_iter()
                .map(|path| format!("{}: mapping skipped, it has validation errors", path)),
        );

        for (table, row) in mapped.rows {
            let Some(key_column) = keys.get(&table) else {
                warn!(table = %table, "No key mapping for table, skipping webhook row");
                outcome
                    .warnings
                    .push(format!("{}: no key mapping", table));
                continue;
            };
            let key = row.get(key_column).cloned().unwrap_or(Value::Null);
            if key.is_null() {
                outcome
                    .warnings
                    .push(format!("{}: payload has no value for {}", table, key_column));
                continue;
            }

            let change = match action {
                WebhookAction::Delete => TableChange {
                    affected: self.writer.delete_by_key(&table, key_column, &key).await?,
                    table,
                    inserted: false,
                },
                WebhookAction::Create | WebhookAction::Update => {
                    let has_values = row.keys().any(|column| column != key_column);
                    let updated = if has_values {
                        self.writer
                            .update_by_key(&table, key_column, &key, &row)
                            .await?
                    } else {
                        0
                    };
                    if updated > 0 {
                        TableChange {
                            table,
                            affected: updated,
                            inserted: false,
                        }
                    } else {
                        debug!(table = %table, "No row updated, upserting");
                        let policy = if has_values {
                            ConflictPolicy::Update
                        } else {
                            ConflictPolicy::Skip
                        };
                        let options = UpsertOptions::new(&table, key_column).on_conflict(policy);
                        let result = self.writer.upsert(&options, &[row]).await?;
                        if let Some(error) = result.errors.first() {
                            bail!("Failed to write {} row: {}", table, error.message);
                        }
                        TableChange {
                            table,
                            affected: result.written(),
                            inserted: result.inserted > 0,
                        }
                    }
                }
            };
            outcome.changes.push(change);
        }

        info!(
            "Applied {} webhook for {} to {} table(s)",
            topic,
            entity.name,
            outcome.changes.len()
        );
        Ok(outcome)
    }
}
