use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// GraphQL type kind of a field's unwrapped base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldKind {
    Scalar,
    Object,
    Enum,
    List,
    Interface,
    Union,
    InputObject,
    NonNull,
}

impl FieldKind {
    pub fn is_leaf(&self) -> bool {
        matches!(self, FieldKind::Scalar | FieldKind::Enum)
    }
}

/// How a remote field is classified by the introspection flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCategory {
    Entity,
    ObjectType,
    Metafield,
    Contextual,
    Computed,
    Connection,
    Polymorphic,
}

impl FieldCategory {
    /// Metafield, contextual and computed fields are never addressable by a mapping.
    pub fn is_hidden(&self) -> bool {
        matches!(
            self,
            FieldCategory::Metafield | FieldCategory::Contextual | FieldCategory::Computed
        )
    }

    /// Connection and polymorphic fields are shown but cannot be mapped directly.
    pub fn is_readonly(&self) -> bool {
        matches!(self, FieldCategory::Connection | FieldCategory::Polymorphic)
    }
}

/// A single field of a cached remote type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteField {
    pub name: String,
    pub kind: FieldKind,
    pub base_type: String,
    pub category: FieldCategory,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_deprecated: bool,
}

impl RemoteField {
    pub fn scalar(name: &str, base_type: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Scalar,
            base_type: base_type.to_string(),
            category: FieldCategory::Entity,
            description: None,
            is_deprecated: false,
        }
    }

    pub fn object(name: &str, base_type: &str, category: FieldCategory) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Object,
            base_type: base_type.to_string(),
            category,
            description: None,
            is_deprecated: false,
        }
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_category(mut self, category: FieldCategory) -> Self {
        self.category = category;
        self
    }

    /// `*Connection` wrappers page over another type and are never expanded.
    pub fn is_connection_wrapper(&self) -> bool {
        self.base_type.ends_with("Connection")
    }
}

/// Category of a schema cache row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    Entity,
    ObjectType,
    MetafieldDefinitions,
}

impl CacheCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Entity => "entity",
            CacheCategory::ObjectType => "object_type",
            CacheCategory::MetafieldDefinitions => "metafield_definitions",
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = crate::errors::SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity" => Ok(CacheCategory::Entity),
            "object_type" => Ok(CacheCategory::ObjectType),
            "metafield_definitions" => Ok(CacheCategory::MetafieldDefinitions),
            other => Err(crate::errors::SchemaError::UnknownCategory(other.to_string())),
        }
    }
}

/// Merchant-defined metafield definition attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetafieldDefinition {
    pub namespace: String,
    pub key: String,
    /// Metafield value type as reported by the platform, e.g. `single_line_text_field`.
    #[serde(default)]
    pub value_type: Option<String>,
}

/// Everything known about the remote side of one connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSchema {
    /// Root entity name -> fields in declared order.
    pub resources: HashMap<String, Vec<RemoteField>>,
    /// Nested object type name -> fields.
    #[serde(default)]
    pub object_types: HashMap<String, Vec<RemoteField>>,
    /// Root entity name -> metafield definitions.
    #[serde(default)]
    pub metafield_definitions: HashMap<String, Vec<MetafieldDefinition>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_field_round_trips_camel_case() {
        let json = serde_json::json!({
            "name": "seo",
            "kind": "OBJECT",
            "baseType": "SEO",
            "category": "object_type",
            "isDeprecated": false
        });
        let field: RemoteField = serde_json::from_value(json).unwrap();
        assert_eq!(field.kind, FieldKind::Object);
        assert_eq!(field.category, FieldCategory::ObjectType);
        assert!(field.description.is_none());
    }

    #[test]
    fn test_category_visibility() {
        assert!(FieldCategory::Computed.is_hidden());
        assert!(FieldCategory::Contextual.is_hidden());
        assert!(!FieldCategory::Connection.is_hidden());
        assert!(FieldCategory::Polymorphic.is_readonly());
    }

    #[test]
    fn test_cache_category_parse() {
        assert_eq!(
            "object_type".parse::<CacheCategory>().unwrap(),
            CacheCategory::ObjectType
        );
        assert!("views".parse::<CacheCategory>().is_err());
    }
}
