use chrono::Utc;
use sea_orm::*;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::database::entities::{field_mappings, schema_cache};
use crate::errors::{SchemaError, SchemaResult};
use crate::schema::mapping::field_depth;
use crate::schema::{
    catalog, CacheCategory, FieldMapping, MetafieldDefinition, RemoteField, RemoteSchema,
    Transform,
};

/// Read and write access to cached remote types and persisted field mappings.
#[derive(Clone)]
pub struct SchemaCacheService {
    db: DatabaseConnection,
}

impl SchemaCacheService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn load_entity_fields(
        &self,
        connection_id: &str,
        entity: &str,
    ) -> SchemaResult<Option<Vec<RemoteField>>> {
        let row = self
            .find_row(connection_id, CacheCategory::Entity, entity)
            .await?;
        row.map(|row| decode_fields(&row)).transpose()
    }

    /// All cached object types for the connection in one query.
    pub async fn load_object_types(
        &self,
        connection_id: &str,
    ) -> SchemaResult<HashMap<String, Vec<RemoteField>>> {
        let rows = schema_cache::Entity::find()
            .filter(schema_cache::Column::ConnectionId.eq(connection_id))
            .filter(schema_cache::Column::Category.eq(CacheCategory::ObjectType.as_str()))
            .all(&self.db)
            .await?;

        let mut types = HashMap::with_capacity(rows.len());
        for row in rows {
            let fields = decode_fields(&row)?;
            types.insert(row.type_name, fields);
        }
        Ok(types)
    }

    pub async fn load_metafield_definitions(
        &self,
        connection_id: &str,
    ) -> SchemaResult<HashMap<String, Vec<MetafieldDefinition>>> {
        let rows = schema_cache::Entity::find()
            .filter(schema_cache::Column::ConnectionId.eq(connection_id))
            .filter(
                schema_cache::Column::Category
                    .eq(CacheCategory::MetafieldDefinitions.as_str()),
            )
            .all(&self.db)
            .await?;

        let mut definitions = HashMap::with_capacity(rows.len());
        for row in rows {
            let decoded: Vec<MetafieldDefinition> = serde_json::from_str(&row.schema_json)
                .map_err(|source| SchemaError::CorruptEntry {
                    type_name: row.type_name.clone(),
                    source,
                })?;
            definitions.insert(row.type_name, decoded);
        }
        Ok(definitions)
    }

    /// Everything the validator needs about the remote side, or `None` when
    /// introspection has not run for this connection.
    pub async fn load_remote_schema(&self, connection_id: &str) -> SchemaResult<Option<RemoteSchema>> {
        if self.is_empty(connection_id).await? {
            return Ok(None);
        }

        let entity_rows = schema_cache::Entity::find()
            .filter(schema_cache::Column::ConnectionId.eq(connection_id))
            .filter(schema_cache::Column::Category.eq(CacheCategory::Entity.as_str()))
            .all(&self.db)
            .await?;

        let mut resources = HashMap::with_capacity(entity_rows.len());
        for row in entity_rows {
            let fields = decode_fields(&row)?;
            resources.insert(row.type_name, fields);
        }

        Ok(Some(RemoteSchema {
            resources,
            object_types: self.load_object_types(connection_id).await?,
            metafield_definitions: self.load_metafield_definitions(connection_id).await?,
        }))
    }

    pub async fn load_mappings(&self, connection_id: &str) -> SchemaResult<Vec<FieldMapping>> {
        let rows = field_mappings::Entity::find()
            .filter(field_mappings::Column::ConnectionId.eq(connection_id))
            .order_by_asc(field_mappings::Column::FullPath)
            .all(&self.db)
            .await?;
        rows.into_iter().map(mapping_from_model).collect()
    }

    pub async fn load_entity_mappings(
        &self,
        connection_id: &str,
        entity_type: &str,
    ) -> SchemaResult<Vec<FieldMapping>> {
        let rows = field_mappings::Entity::find()
            .filter(field_mappings::Column::ConnectionId.eq(connection_id))
            .filter(field_mappings::Column::EntityType.eq(entity_type))
            .order_by_asc(field_mappings::Column::FullPath)
            .all(&self.db)
            .await?;
        rows.into_iter().map(mapping_from_model).collect()
    }

    pub async fn is_empty(&self, connection_id: &str) -> SchemaResult<bool> {
        let count = schema_cache::Entity::find()
            .filter(schema_cache::Column::ConnectionId.eq(connection_id))
            .count(&self.db)
            .await?;
        Ok(count == 0)
    }

    /// Upserts one cached type by `(connection, category, type_name)`.
    pub async fn store_type<T: serde::Serialize + ?Sized>(
        &self,
        connection_id: &str,
        category: CacheCategory,
        type_name: &str,
        fields: &T,
    ) -> SchemaResult<()> {
        if category == CacheCategory::Entity && !catalog::is_known_entity(type_name) {
            return Err(SchemaError::UnknownEntity(type_name.to_string()));
        }

        let schema_json = serde_json::to_string(fields)?;
        let now = Utc::now();

        match self.find_row(connection_id, category, type_name).await? {
            Some(existing) => {
                let mut active: schema_cache::ActiveModel = existing.into();
                active.schema_json = Set(schema_json);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let row = schema_cache::ActiveModel {
                    connection_id: Set(connection_id.to_string()),
                    category: Set(category.as_str().to_string()),
                    type_name: Set(type_name.to_string()),
                    schema_json: Set(schema_json),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                row.insert(&self.db).await?;
            }
        }

        debug!("Cached {} {} for {}", category, type_name, connection_id);
        Ok(())
    }

    /// Upserts a mapping by `(connection, full_path)`. Protected mappings are
    /// always stored enabled.
    pub async fn save_mapping(
        &self,
        connection_id: &str,
        mapping: &FieldMapping,
    ) -> SchemaResult<FieldMapping> {
        if !catalog::is_known_entity(&mapping.entity_type) {
            return Err(SchemaError::UnknownEntity(mapping.entity_type.clone()));
        }
        let expected = format!("{}.{}", mapping.entity_type, mapping.field_path);
        if mapping.field_path.is_empty() || mapping.full_path != expected {
            return Err(SchemaError::InvalidFieldPath {
                path: mapping.full_path.clone(),
                reason: format!("expected '{}'", expected),
            });
        }

        let (transform_type, transform_config) = match &mapping.transform {
            Some(transform) => {
                let (kind, config) = transform.to_parts()?;
                (Some(kind), Some(config))
            }
            None => (None, None),
        };
        let source_fields = if mapping.source_fields.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&mapping.source_fields)?)
        };
        let enabled = mapping.enabled || mapping.is_protected;
        let now = Utc::now();

        let existing = field_mappings::Entity::find()
            .filter(field_mappings::Column::ConnectionId.eq(connection_id))
            .filter(field_mappings::Column::FullPath.eq(&mapping.full_path))
            .one(&self.db)
            .await?;

        let mut active = match existing {
            Some(model) => {
                // Protection is a property of the stored row, not the request
                let protected = model.is_protected || mapping.is_protected;
                let mut active: field_mappings::ActiveModel = model.into();
                active.is_protected = Set(protected);
                active.enabled = Set(enabled || protected);
                active
            }
            None => field_mappings::ActiveModel {
                connection_id: Set(connection_id.to_string()),
                entity_type: Set(mapping.entity_type.clone()),
                field_path: Set(mapping.field_path.clone()),
                full_path: Set(mapping.full_path.clone()),
                is_protected: Set(mapping.is_protected),
                enabled: Set(enabled),
                created_at: Set(now),
                ..Default::default()
            },
        };

        active.depth = Set(i32::from(field_depth(&mapping.field_path)));
        active.target_table = Set(mapping.target_table.clone());
        active.target_column = Set(mapping.target_column.clone());
        active.transform_type = Set(transform_type);
        active.transform_config = Set(transform_config);
        active.source_fields = Set(source_fields);
        active.is_key = Set(mapping.is_key);
        active.access_status = Set(mapping.access_status.as_str().to_string());
        active.updated_at = Set(now);

        let saved = active.save(&self.db).await?;
        let model = saved.try_into_model()?;
        info!("Saved mapping {} for {}", model.full_path, connection_id);
        mapping_from_model(model)
    }

    /// Disables a mapping; protected mappings refuse.
    pub async fn set_mapping_enabled(
        &self,
        connection_id: &str,
        full_path: &str,
        enabled: bool,
    ) -> SchemaResult<()> {
        let model = field_mappings::Entity::find()
            .filter(field_mappings::Column::ConnectionId.eq(connection_id))
            .filter(field_mappings::Column::FullPath.eq(full_path))
            .one(&self.db)
            .await?
            .ok_or_else(|| SchemaError::MappingNotFound(full_path.to_string()))?;

        if model.is_protected && !enabled {
            return Err(SchemaError::ProtectedMapping(full_path.to_string()));
        }

        let mut active: field_mappings::ActiveModel = model.into();
        active.enabled = Set(enabled);
        active.updated_at = Set(Utc::now());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn find_row(
        &self,
        connection_id: &str,
        category: CacheCategory,
        type_name: &str,
    ) -> SchemaResult<Option<schema_cache::Model>> {
        Ok(schema_cache::Entity::find()
            .filter(schema_cache::Column::ConnectionId.eq(connection_id))
            .filter(schema_cache::Column::Category.eq(category.as_str()))
            .filter(schema_cache::Column::TypeName.eq(type_name))
            .one(&self.db)
            .await?)
    }
}

fn decode_fields(row: &schema_cache::Model) -> SchemaResult<Vec<RemoteField>> {
    serde_json::from_str(&row.schema_json).map_err(|source| SchemaError::CorruptEntry {
        type_name: row.type_name.clone(),
        source,
    })
}

pub fn mapping_from_model(model: field_mappings::Model) -> SchemaResult<FieldMapping> {
    let transform = match model.transform_type.as_deref() {
        Some(kind) if !kind.is_empty() => Some(Transform::from_parts(
            kind,
            model.transform_config.as_deref(),
        )?),
        _ => None,
    };
    let source_fields = match model.source_fields.as_deref() {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
        _ => Vec::new(),
    };

    Ok(FieldMapping {
        id: Some(model.id),
        entity_type: model.entity_type,
        field_path: model.field_path,
        full_path: model.full_path,
        depth: u8::try_from(model.depth).unwrap_or(1),
        target_table: model.target_table,
        target_column: model.target_column,
        transform,
        source_fields,
        is_key: model.is_key,
        enabled: model.enabled || model.is_protected,
        is_protected: model.is_protected,
        access_status: model.access_status.into(),
    })
}
