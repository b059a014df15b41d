use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::errors::SchemaResult;
use crate::schema::expression::{lookup_path, Expression};
use crate::schema::transform::{template_placeholders, LookupSource, TransformEngine};
use crate::schema::{FieldMapping, Transform};
use crate::services::{validate, RelationalSchema, SchemaCacheService};
use crate::writer::Row;

/// Enabled mappings of one entity, split by whether they validate.
#[derive(Debug, Clone, Default)]
pub struct MappingSelection {
    pub usable: Vec<FieldMapping>,
    /// `fullPath` and the validation errors that excluded it
    pub rejected: Vec<(String, Vec<String>)>,
}

impl MappingSelection {
    pub fn rejected_paths(&self) -> Vec<&str> {
        self.rejected.iter().map(|(path, _)| path.as_str()).collect()
    }
}

/// Loads the entity's mappings and drops those with validation errors.
pub async fn select_mappings(
    cache: &SchemaCacheService,
    connection_id: &str,
    entity_type: &str,
    relational: Option<&RelationalSchema>,
) -> SchemaResult<MappingSelection> {
    let mappings = cache.load_entity_mappings(connection_id, entity_type).await?;
    let remote = cache.load_remote_schema(connection_id).await?;
    let validation = validate(&mappings, relational, remote.as_ref());

    let mut selection = MappingSelection::default();
    for mapping in mappings.into_iter().filter(|m| m.enabled) {
        if validation.has_errors_for(&mapping.full_path) {
            let reasons = validation
                .errors_for(&mapping.full_path)
                .map(|issue| issue.message.clone())
                .collect();
            selection.rejected.push((mapping.full_path, reasons));
        } else {
            selection.usable.push(mapping);
        }
    }
    Ok(selection)
}

/// One remote record spread over its target tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRecord {
    /// Target table -> row, tables in mapping order
    pub rows: IndexMap<String, Row>,
    /// Transform problems; the affected column holds `null`
    pub warnings: Vec<String>,
}

/// Turns remote records into rows following the enabled mappings of one entity.
pub struct RecordMapper<'a> {
    mappings: Vec<FieldMapping>,
    engine: TransformEngine<'a>,
}

impl<'a> RecordMapper<'a> {
    /// Disabled mappings and mappings without a target are dropped.
    pub fn new(mappings: &[FieldMapping], lookups: Option<&'a dyn LookupSource>) -> Self {
        let mappings = mappings
            .iter()
            .filter(|m| m.enabled && m.target().is_some())
            .cloned()
            .collect();
        Self {
            mappings,
            engine: TransformEngine::new(lookups),
        }
    }

    pub fn mappings(&self) -> &[FieldMapping] {
        &self.mappings
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Remote paths to request: every source plus the fields that formulas
    /// and templates read. Always includes `id`.
    pub fn source_paths(&self) -> Vec<String> {
        let mut paths = BTreeSet::from(["id".to_string()]);
        for mapping in &self.mappings {
            paths.extend(mapping.sources().into_iter().map(str::to_string));
            match &mapping.transform {
                Some(Transform::Expression { formula }) => {
                    if let Ok(expression) = Expression::parse(formula) {
                        paths.extend(expression.field_references());
                    }
                }
                Some(Transform::Template { template }) => {
                    paths.extend(template_placeholders(template));
                }
                _ => {}
            }
        }
        paths.remove("value");
        paths.into_iter().collect()
    }

    /// Upsert key column per target table, in table order.
    pub fn key_columns(&self) -> IndexMap<String, String> {
        let mut keys = IndexMap::new();
        for mapping in self.mappings.iter().filter(|m| m.is_upsert_key()) {
            if let Some((table, column)) = mapping.target() {
                keys.entry(table.to_string())
                    .or_insert_with(|| column.to_string());
            }
        }
        keys
    }

    /// Target tables in the order they should be written.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for (table, _) in self.mappings.iter().filter_map(FieldMapping::target) {
            if !tables.iter().any(|t| t == table) {
                tables.push(table.to_string());
            }
        }
        tables
    }

    pub async fn map_record(&mut self, record: &Value) -> MappedRecord {
        let mut mapped = MappedRecord::default();
        for mapping in &self.mappings {
            let Some((table, column)) = mapping.target() else {
                continue;
            };

            let sources = mapping.sources();
            let mut value = if sources.len() == 1 {
                lookup_path(record, sources[0])
            } else {
                Value::Array(sources.iter().map(|s| lookup_path(record, s)).collect())
            };

            if let Some(transform) = &mapping.transform {
                let outcome = self.engine.apply(transform, value, record).await;
                if let Some(warning) = outcome.warning {
                    mapped
                        .warnings
                        .push(format!("{}: {}", mapping.full_path, warning));
                }
                value = outcome.value;
            }

            mapped
                .rows
                .entry(table.to_string())
                .or_default()
                .insert(column.to_string(), value);
        }
        mapped
    }
}
