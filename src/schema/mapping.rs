use serde::{Deserialize, Serialize};

use crate::errors::{SchemaError, SchemaResult};

/// Value transform applied between the remote field and the target column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Resolve the source value against another table
    #[serde(rename_all = "camelCase")]
    Lookup {
        table: String,
        match_column: String,
        return_column: String,
    },
    /// Evaluate a formula in the sandboxed expression language
    Expression { formula: String },
    /// Substitute `{field}` placeholders
    Template { template: String },
    #[serde(rename_all = "camelCase")]
    Coerce { target_type: String },
    #[serde(rename_all = "camelCase")]
    Default {
        value: serde_json::Value,
        #[serde(default = "default_only_if_null")]
        only_if_null: bool,
    },
}

fn default_only_if_null() -> bool {
    true
}

pub const COERCE_TARGETS: &[&str] = &["string", "number", "integer", "boolean", "datetime", "json"];

impl Transform {
    pub fn type_name(&self) -> &'static str {
        match self {
            Transform::Lookup { .. } => "lookup",
            Transform::Expression { .. } => "expression",
            Transform::Template { .. } => "template",
            Transform::Coerce { .. } => "coerce",
            Transform::Default { .. } => "default",
        }
    }

    /// Splits into the persisted `(transform_type, transform_config)` pair.
    pub fn to_parts(&self) -> SchemaResult<(String, String)> {
        let mut value = serde_json::to_value(self)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("type");
        }
        Ok((self.type_name().to_string(), serde_json::to_string(&value)?))
    }

    pub fn from_parts(transform_type: &str, config: Option<&str>) -> SchemaResult<Self> {
        let mut value: serde_json::Value = match config {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)?,
            _ => serde_json::json!({}),
        };
        let object = value
            .as_object_mut()
            .ok_or_else(|| SchemaError::InvalidFieldPath {
                path: transform_type.to_string(),
                reason: "transform config must be a JSON object".to_string(),
            })?;
        object.insert(
            "type".to_string(),
            serde_json::Value::String(transform_type.to_string()),
        );
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Accessible,
    Restricted,
    Unknown,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Accessible => "accessible",
            AccessStatus::Restricted => "restricted",
            AccessStatus::Unknown => "unknown",
        }
    }
}

impl From<String> for AccessStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "accessible" => AccessStatus::Accessible,
            "restricted" => AccessStatus::Restricted,
            _ => AccessStatus::Unknown,
        }
    }
}

/// One configured remote-field-to-column mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    #[serde(default)]
    pub id: Option<i32>,
    pub entity_type: String,
    pub field_path: String,
    pub full_path: String,
    pub depth: u8,
    pub target_table: Option<String>,
    pub target_column: Option<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
    /// Explicit multi-source reference list; empty means `field_path` only
    #[serde(default)]
    pub source_fields: Vec<String>,
    #[serde(default)]
    pub is_key: bool,
    pub enabled: bool,
    #[serde(default)]
    pub is_protected: bool,
    #[serde(default = "default_access_status")]
    pub access_status: AccessStatus,
}

fn default_access_status() -> AccessStatus {
    AccessStatus::Accessible
}

impl FieldMapping {
    /// Builds an enabled mapping; `full_path` and `depth` are derived from the path.
    pub fn new(entity_type: &str, field_path: &str, table: &str, column: &str) -> Self {
        Self {
            id: None,
            entity_type: entity_type.to_string(),
            field_path: field_path.to_string(),
            full_path: format!("{}.{}", entity_type, field_path),
            depth: field_depth(field_path),
            target_table: Some(table.to_string()),
            target_column: Some(column.to_string()),
            transform: None,
            source_fields: Vec::new(),
            is_key: false,
            enabled: true,
            is_protected: false,
            access_status: AccessStatus::Accessible,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_sources(mut self, sources: &[&str]) -> Self {
        self.source_fields = sources.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn protected(mut self) -> Self {
        self.is_protected = true;
        self
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Source paths this mapping reads from the remote record.
    pub fn sources(&self) -> Vec<&str> {
        if self.source_fields.is_empty() {
            vec![self.field_path.as_str()]
        } else {
            self.source_fields.iter().map(String::as_str).collect()
        }
    }

    /// Protected `id` mappings act as the upsert key unless another key is set.
    pub fn is_upsert_key(&self) -> bool {
        self.is_key || (self.is_protected && self.field_path == "id")
    }

    pub fn target(&self) -> Option<(&str, &str)> {
        match (self.target_table.as_deref(), self.target_column.as_deref()) {
            (Some(table), Some(column)) => Some((table, column)),
            _ => None,
        }
    }
}

/// `metafields.ns.key` counts as a single field; otherwise one level per dot.
pub fn field_depth(field_path: &str) -> u8 {
    if field_path.starts_with("metafields.") {
        return 1;
    }
    if field_path.contains('.') {
        2
    } else {
        1
    }
}

/// Splits `metafields.<namespace>.<key>` into its parts.
pub fn parse_metafield_path(field_path: &str) -> Option<(&str, &str)> {
    let rest = field_path.strip_prefix("metafields.")?;
    let (namespace, key) = rest.split_once('.')?;
    if namespace.is_empty() || key.is_empty() || key.contains('.') {
        return None;
    }
    Some((namespace, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transform_parts_round_trip() {
        let transform = Transform::Lookup {
            table: "vendors".to_string(),
            match_column: "name".to_string(),
            return_column: "id".to_string(),
        };
        let (kind, config) = transform.to_parts().unwrap();
        assert_eq!(kind, "lookup");
        let config_json: serde_json::Value = serde_json::from_str(&config).unwrap();
        assert_eq!(config_json["matchColumn"], "name");
        assert!(config_json.get("type").is_none());
        assert_eq!(Transform::from_parts(&kind, Some(&config)).unwrap(), transform);
    }

    #[test]
    fn test_default_transform_only_if_null_defaults_true() {
        let transform: Transform = serde_json::from_value(json!({"type": "default", "value": 0})).unwrap();
        assert_eq!(
            transform,
            Transform::Default {
                value: json!(0),
                only_if_null: true
            }
        );
    }

    #[test]
    fn test_unknown_transform_type_rejected() {
        assert!(Transform::from_parts("script", Some("{}")).is_err());
    }

    #[test]
    fn test_mapping_paths() {
        let mapping = FieldMapping::new("Product", "seo.title", "products", "seo_title");
        assert_eq!(mapping.full_path, "Product.seo.title");
        assert_eq!(mapping.depth, 2);
        assert_eq!(mapping.sources(), vec!["seo.title"]);

        let metafield = FieldMapping::new("Product", "metafields.custom.color", "products", "color");
        assert_eq!(metafield.depth, 1);
        assert_eq!(
            parse_metafield_path(&metafield.field_path),
            Some(("custom", "color"))
        );
        assert_eq!(parse_metafield_path("metafields.custom"), None);
    }

    #[test]
    fn test_protected_id_is_key() {
        let mapping = FieldMapping::new("Product", "id", "products", "shopify_id").protected();
        assert!(mapping.is_upsert_key());
        let title = FieldMapping::new("Product", "title", "products", "title");
        assert!(!title.is_upsert_key());
    }
}
