//! Validation of field mappings against both schema sides.
//!
//! Problems are reported as data in a [`ValidationResult`]; a missing schema
//! or a broken mapping never turns into an `Err`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::errors::SchemaResult;
use crate::schema::expression::Expression;
use crate::schema::mapping::{parse_metafield_path, COERCE_TARGETS};
use crate::schema::transform::template_placeholders;
use crate::schema::{FieldKind, FieldMapping, MetafieldDefinition, RemoteField, RemoteSchema, Transform};
use crate::services::relational_schema::{DatabaseColumn, RelationalSchema};
use crate::services::schema_cache::SchemaCacheService;

/// Normalized type family used for compatibility checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeCategory {
    String,
    Number,
    Boolean,
    Datetime,
    Json,
    Unknown,
}

impl TypeCategory {
    pub const ALL: [TypeCategory; 6] = [
        TypeCategory::String,
        TypeCategory::Number,
        TypeCategory::Boolean,
        TypeCategory::Datetime,
        TypeCategory::Json,
        TypeCategory::Unknown,
    ];

    pub fn from_remote_type(base_type: &str, kind: FieldKind) -> Self {
        if kind == FieldKind::Enum {
            return TypeCategory::String;
        }
        match base_type {
            "String" | "ID" | "HTML" | "URL" | "FormattedString" | "Color" | "StorefrontID" => {
                TypeCategory::String
            }
            "Int" | "Float" | "Decimal" | "Money" | "UnsignedInt64" | "BigInt" => {
                TypeCategory::Number
            }
            "Boolean" => TypeCategory::Boolean,
            "DateTime" | "Date" => TypeCategory::Datetime,
            "JSON" => TypeCategory::Json,
            _ if kind == FieldKind::Object => TypeCategory::Json,
            _ => TypeCategory::Unknown,
        }
    }

    pub fn from_sql_type(data_type: &str) -> Self {
        let lower = data_type.to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or_default();
        let word = base.split_whitespace().next().unwrap_or_default();
        match word {
            "json" | "jsonb" => TypeCategory::Json,
            "bool" | "boolean" | "bit" => TypeCategory::Boolean,
            "date" | "datetime" | "datetime2" | "datetimeoffset" | "smalldatetime"
            | "timestamp" | "timestamptz" | "time" | "timetz" => TypeCategory::Datetime,
            "int" | "integer" | "smallint" | "bigint" | "tinyint" | "mediumint" | "int2"
            | "int4" | "int8" | "serial" | "smallserial" | "bigserial" | "decimal" | "numeric"
            | "real" | "float" | "float4" | "float8" | "double" | "money" | "smallmoney"
            | "number" => TypeCategory::Number,
            "char" | "character" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext"
            | "tinytext" | "mediumtext" | "longtext" | "citext" | "uuid" | "uniqueidentifier"
            | "enum" | "set" | "xml" | "string" | "clob" => TypeCategory::String,
            _ => TypeCategory::Unknown,
        }
    }

    pub fn from_metafield_type(value_type: Option<&str>) -> Self {
        let Some(value_type) = value_type else {
            return TypeCategory::Unknown;
        };
        if value_type.starts_with("list.") {
            return TypeCategory::Json;
        }
        match value_type {
            "single_line_text_field" | "multi_line_text_field" | "url" | "color" => {
                TypeCategory::String
            }
            t if t.ends_with("_reference") => TypeCategory::String,
            "number_integer" | "number_decimal" | "rating" => TypeCategory::Number,
            "boolean" => TypeCategory::Boolean,
            "date" | "date_time" => TypeCategory::Datetime,
            "json" | "money" | "dimension" | "volume" | "weight" | "rich_text_field" => {
                TypeCategory::Json
            }
            _ => TypeCategory::Unknown,
        }
    }

    pub fn from_coerce_target(target_type: &str) -> Self {
        match target_type {
            "string" => TypeCategory::String,
            "number" | "integer" => TypeCategory::Number,
            "boolean" => TypeCategory::Boolean,
            "datetime" => TypeCategory::Datetime,
            "json" => TypeCategory::Json,
            _ => TypeCategory::Unknown,
        }
    }
}

/// Verdict for one ordered (source, target) category pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compatibility {
    Compatible,
    /// Compatible, values are converted on write
    Coercion,
    /// Compatible, structured values are serialized to text
    Serialization,
    /// Compatible, but one side has no known type
    Unverified,
    Incompatible,
}

pub fn compatibility(source: TypeCategory, target: TypeCategory) -> Compatibility {
    use TypeCategory::*;
    match (source, target) {
        (Unknown, _) | (_, Unknown) => Compatibility::Unverified,
        (s, t) if s == t => Compatibility::Compatible,
        (Number, String) | (Datetime, String) => Compatibility::Compatible,
        (String, Number) | (String, Datetime) => Compatibility::Coercion,
        (Json, String) => Compatibility::Serialization,
        _ => Compatibility::Incompatible,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    MissingRemoteSchema,
    MissingRelationalSchema,
    DuplicateMapping,
    ProtectedDisabled,
    UnknownEntity,
    UnknownSourceField,
    UnknownMetafield,
    ReadonlySource,
    MissingTarget,
    UnknownTable,
    UnknownColumn,
    InvalidTransform,
    UnresolvedReference,
    Unverifiable,
    TypeCoercion,
    TypeSerialization,
    TypeUnverified,
    IncompatibleTypes,
    Truncation,
    NotNullable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// `None` for issues that concern the whole configuration
    pub full_path: Option<String>,
    pub code: IssueCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_transform: Option<Transform>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub total_mappings: usize,
    pub enabled_mappings: usize,
    pub mappings_with_errors: usize,
    pub mappings_with_warnings: usize,
    pub incompatible_mappings: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub stats: ValidationStats,
}

impl ValidationResult {
    pub fn errors_for<'a>(&'a self, full_path: &'a str) -> impl Iterator<Item = &'a ValidationIssue> {
        self.errors
            .iter()
            .filter(move |issue| issue.full_path.as_deref() == Some(full_path))
    }

    pub fn warnings_for<'a>(
        &'a self,
        full_path: &'a str,
    ) -> impl Iterator<Item = &'a ValidationIssue> {
        self.warnings
            .iter()
            .filter(move |issue| issue.full_path.as_deref() == Some(full_path))
    }

    pub fn has_errors_for(&self, full_path: &str) -> bool {
        self.errors_for(full_path).next().is_some()
    }
}

/// Case-insensitive view of the remote schema.
struct RemoteIndex<'a> {
    resources: HashMap<String, &'a [RemoteField]>,
    object_types: HashMap<String, &'a [RemoteField]>,
    metafields: HashMap<String, &'a [MetafieldDefinition]>,
}

impl<'a> RemoteIndex<'a> {
    fn new(schema: &'a RemoteSchema) -> Self {
        fn lower<'a, T>(map: &'a HashMap<String, Vec<T>>) -> HashMap<String, &'a [T]> {
            map.iter()
                .map(|(name, items)| (name.to_ascii_lowercase(), items.as_slice()))
                .collect()
        }
        Self {
            resources: lower(&schema.resources),
            object_types: lower(&schema.object_types),
            metafields: lower(&schema.metafield_definitions),
        }
    }

    fn resolve(&self, entity: &str, path: &str) -> Result<TypeCategory, (IssueCode, String)> {
        let fields = self
            .resources
            .get(&entity.to_ascii_lowercase())
            .ok_or_else(|| {
                (
                    IssueCode::UnknownEntity,
                    format!("Entity '{}' is not in the remote schema", entity),
                )
            })?;

        if path.starts_with("metafields.") {
            let (namespace, key) = parse_metafield_path(path).ok_or_else(|| {
                (
                    IssueCode::UnknownSourceField,
                    format!("Malformed metafield path '{}'", path),
                )
            })?;
            let definition = self
                .metafields
                .get(&entity.to_ascii_lowercase())
                .and_then(|defs| {
                    defs.iter().find(|d| {
                        d.namespace.eq_ignore_ascii_case(namespace)
                            && d.key.eq_ignore_ascii_case(key)
                    })
                })
                .ok_or_else(|| {
                    (
                        IssueCode::UnknownMetafield,
                        format!("No metafield definition {}.{} on {}", namespace, key, entity),
                    )
                })?;
            return Ok(TypeCategory::from_metafield_type(
                definition.value_type.as_deref(),
            ));
        }

        let segments: Vec<&str> = path.split('.').collect();
        let field = find_field(fields, segments[0]).ok_or_else(|| unknown_field(entity, path))?;
        match segments.len() {
            1 => {
                if field.category.is_readonly() {
                    return Err((
                        IssueCode::ReadonlySource,
                        format!("{}.{} is read-only and cannot be mapped directly", entity, path),
                    ));
                }
                Ok(TypeCategory::from_remote_type(&field.base_type, field.kind))
            }
            2 => {
                let sub_fields = self
                    .object_types
                    .get(&field.base_type.to_ascii_lowercase())
                    .ok_or_else(|| {
                        (
                            IssueCode::UnknownSourceField,
                            format!("Object type '{}' is not cached", field.base_type),
                        )
                    })?;
                let sub = find_field(sub_fields, segments[1])
                    .ok_or_else(|| unknown_field(entity, path))?;
                Ok(TypeCategory::from_remote_type(&sub.base_type, sub.kind))
            }
            _ => Err((
                IssueCode::UnknownSourceField,
                format!("Field path '{}' is deeper than two levels", path),
            )),
        }
    }
}

fn find_field<'a>(fields: &'a [RemoteField], name: &str) -> Option<&'a RemoteField> {
    fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

fn unknown_field(entity: &str, path: &str) -> (IssueCode, String) {
    (
        IssueCode::UnknownSourceField,
        format!("Field '{}' does not exist on {}", path, entity),
    )
}

struct Collector {
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
}

impl Collector {
    fn error(&mut self, full_path: Option<&str>, code: IssueCode, message: String) {
        self.errors.push(ValidationIssue {
            full_path: full_path.map(str::to_string),
            code,
            message,
            suggested_transform: None,
        });
    }

    fn warning(
        &mut self,
        full_path: &str,
        code: IssueCode,
        message: String,
        suggested_transform: Option<Transform>,
    ) {
        self.warnings.push(ValidationIssue {
            full_path: Some(full_path.to_string()),
            code,
            message,
            suggested_transform,
        });
    }
}

/// Validates `mappings` in order; the result depends only on the inputs.
pub fn validate(
    mappings: &[FieldMapping],
    relational: Option<&RelationalSchema>,
    remote: Option<&RemoteSchema>,
) -> ValidationResult {
    let mut out = Collector {
        errors: Vec::new(),
        warnings: Vec::new(),
    };
    let mut stats = ValidationStats {
        total_mappings: mappings.len(),
        ..Default::default()
    };

    if remote.is_none() {
        out.error(
            None,
            IssueCode::MissingRemoteSchema,
            "Remote schema is not available; source fields cannot be verified".to_string(),
        );
    }
    if relational.is_none() {
        out.error(
            None,
            IssueCode::MissingRelationalSchema,
            "Database schema is not available; target columns cannot be verified".to_string(),
        );
    }

    let index = remote.map(RemoteIndex::new);
    let mut seen = HashSet::new();

    for mapping in mappings {
        let path = mapping.full_path.as_str();
        let (errors_before, warnings_before) = (out.errors.len(), out.warnings.len());

        if !seen.insert(path.to_ascii_lowercase()) {
            out.error(
                Some(path),
                IssueCode::DuplicateMapping,
                format!("Mapping '{}' is configured more than once", path),
            );
        } else if mapping.is_protected && !mapping.enabled {
            out.error(
                Some(path),
                IssueCode::ProtectedDisabled,
                format!("Protected mapping '{}' cannot be disabled", path),
            );
        } else if mapping.enabled {
            stats.enabled_mappings += 1;
            if check_mapping(&mut out, mapping, relational, index.as_ref()) {
                stats.incompatible_mappings += 1;
            }
        }

        if out.errors.len() > errors_before {
            stats.mappings_with_errors += 1;
        }
        if out.warnings.len() > warnings_before {
            stats.mappings_with_warnings += 1;
        }
    }

    ValidationResult {
        valid: out.errors.is_empty(),
        errors: out.errors,
        warnings: out.warnings,
        stats,
    }
}

/// Returns true when the mapping's types are incompatible.
fn check_mapping(
    out: &mut Collector,
    mapping: &FieldMapping,
    relational: Option<&RelationalSchema>,
    index: Option<&RemoteIndex<'_>>,
) -> bool {
    let path = mapping.full_path.as_str();

    let source = match index {
        None => {
            out.warning(
                path,
                IssueCode::Unverifiable,
                "Source field cannot be verified without a remote schema".to_string(),
                None,
            );
            None
        }
        Some(index) => {
            let mut categories = Vec::new();
            for source in mapping.sources() {
                match index.resolve(&mapping.entity_type, source) {
                    Ok(category) => categories.push(category),
                    Err((code, message)) => out.error(Some(path), code, message),
                }
            }
            if categories.len() == mapping.sources().len() {
                Some(combine(&categories))
            } else {
                None
            }
        }
    };

    let target = match mapping.target() {
        None => {
            out.error(
                Some(path),
                IssueCode::MissingTarget,
                "Enabled mapping has no target table and column".to_string(),
            );
            None
        }
        Some((table, column)) => match relational {
            None => {
                out.warning(
                    path,
                    IssueCode::Unverifiable,
                    "Target column cannot be verified without a database schema".to_string(),
                    None,
                );
                None
            }
            Some(schema) => resolve_target(out, path, schema, table, column),
        },
    };

    if let Some(transform) = &mapping.transform {
        check_transform(out, path, &mapping.entity_type, transform, relational, index);
    }

    let Some(column) = target else {
        return false;
    };

    if !column.nullable && !matches!(mapping.transform, Some(Transform::Default { .. })) {
        out.warning(
            path,
            IssueCode::NotNullable,
            format!(
                "Column '{}' is NOT NULL; missing source values will fail the write",
                column.name
            ),
            Some(Transform::Default {
                value: serde_json::Value::Null,
                only_if_null: true,
            }),
        );
    }

    let Some(source) = source else {
        return false;
    };
    let effective = output_category(mapping.transform.as_ref(), source);
    let target_category = TypeCategory::from_sql_type(&column.data_type);
    check_types(out, path, effective, target_category, column)
}

fn resolve_target<'s>(
    out: &mut Collector,
    path: &str,
    schema: &'s RelationalSchema,
    table: &str,
    column: &str,
) -> Option<&'s DatabaseColumn> {
    let Some(found_table) = schema.find_table(table) else {
        out.error(
            Some(path),
            IssueCode::UnknownTable,
            format!("Table '{}' does not exist", table),
        );
        return None;
    };
    let found = found_table.find_column(column);
    if found.is_none() {
        out.error(
            Some(path),
            IssueCode::UnknownColumn,
            format!("Column '{}.{}' does not exist", table, column),
        );
    }
    found
}

fn check_types(
    out: &mut Collector,
    path: &str,
    source: TypeCategory,
    target: TypeCategory,
    column: &DatabaseColumn,
) -> bool {
    match compatibility(source, target) {
        Compatibility::Compatible => {
            if source == TypeCategory::String && target == TypeCategory::String {
                if let Some(max_length) = column.max_length {
                    out.warning(
                        path,
                        IssueCode::Truncation,
                        format!(
                            "Remote text is unbounded; '{}' holds at most {} characters",
                            column.name, max_length
                        ),
                        None,
                    );
                }
            }
            false
        }
        Compatibility::Coercion => {
            let suggestion = (target == TypeCategory::Number).then(|| Transform::Coerce {
                target_type: "number".to_string(),
            });
            out.warning(
                path,
                IssueCode::TypeCoercion,
                format!("Values are converted from {:?} to {:?}", source, target),
                suggestion,
            );
            false
        }
        Compatibility::Serialization => {
            out.warning(
                path,
                IssueCode::TypeSerialization,
                "Structured values are serialized to JSON text".to_string(),
                None,
            );
            false
        }
        Compatibility::Unverified => {
            out.warning(
                path,
                IssueCode::TypeUnverified,
                format!(
                    "Could not verify type compatibility ({:?} -> {:?})",
                    source, target
                ),
                None,
            );
            false
        }
        Compatibility::Incompatible => {
            out.warning(
                path,
                IssueCode::IncompatibleTypes,
                format!("{:?} values cannot be written to a {:?} column", source, target),
                None,
            );
            true
        }
    }
}

fn check_transform(
    out: &mut Collector,
    path: &str,
    entity: &str,
    transform: &Transform,
    relational: Option<&RelationalSchema>,
    index: Option<&RemoteIndex<'_>>,
) {
    match transform {
        Transform::Lookup {
            table,
            match_column,
            return_column,
        } => {
            if table.is_empty() || match_column.is_empty() || return_column.is_empty() {
                out.error(
                    Some(path),
                    IssueCode::InvalidTransform,
                    "Lookup needs a table, a match column and a return column".to_string(),
                );
                return;
            }
            let Some(schema) = relational else {
                return;
            };
            let Some(lookup_table) = schema.find_table(table) else {
                out.error(
                    Some(path),
                    IssueCode::InvalidTransform,
                    format!("Lookup table '{}' does not exist", table),
                );
                return;
            };
            for column in [match_column, return_column] {
                if lookup_table.find_column(column).is_none() {
                    out.error(
                        Some(path),
                        IssueCode::InvalidTransform,
                        format!("Lookup column '{}.{}' does not exist", table, column),
                    );
                }
            }
        }
        Transform::Expression { formula } => match Expression::parse(formula) {
            Ok(expression) => {
                check_references(out, path, entity, expression.field_references(), index)
            }
            Err(e) => out.error(
                Some(path),
                IssueCode::InvalidTransform,
                format!("Invalid expression: {}", e),
            ),
        },
        Transform::Template { template } => {
            let placeholders = template_placeholders(template);
            if placeholders.is_empty() {
                out.error(
                    Some(path),
                    IssueCode::InvalidTransform,
                    "Template must contain at least one {field} placeholder".to_string(),
                );
            } else {
                check_references(out, path, entity, placeholders, index);
            }
        }
        Transform::Coerce { target_type } => {
            if !COERCE_TARGETS.contains(&target_type.as_str()) {
                out.error(
                    Some(path),
                    IssueCode::InvalidTransform,
                    format!(
                        "Unsupported coerce target '{}', expected one of {}",
                        target_type,
                        COERCE_TARGETS.join(", ")
                    ),
                );
            }
        }
        Transform::Default { .. } => {}
    }
}

fn check_references(
    out: &mut Collector,
    path: &str,
    entity: &str,
    references: Vec<String>,
    index: Option<&RemoteIndex<'_>>,
) {
    let Some(index) = index else {
        return;
    };
    for reference in references {
        if index.resolve(entity, &reference).is_err() {
            out.warning(
                path,
                IssueCode::UnresolvedReference,
                format!("'{}' does not resolve on {}", reference, entity),
                None,
            );
        }
    }
}

fn combine(categories: &[TypeCategory]) -> TypeCategory {
    match categories.split_first() {
        Some((first, rest)) if rest.iter().all(|c| c == first) => *first,
        _ => TypeCategory::Unknown,
    }
}

/// Category of the value that reaches the column once the transform ran.
fn output_category(transform: Option<&Transform>, source: TypeCategory) -> TypeCategory {
    match transform {
        None | Some(Transform::Default { .. }) => source,
        Some(Transform::Coerce { target_type }) => TypeCategory::from_coerce_target(target_type),
        Some(Transform::Template { .. }) => TypeCategory::String,
        Some(Transform::Expression { .. }) | Some(Transform::Lookup { .. }) => {
            TypeCategory::Unknown
        }
    }
}

/// Loads a connection's mappings and remote schema and validates them.
#[derive(Clone)]
pub struct MappingValidatorService {
    cache: SchemaCacheService,
}

impl MappingValidatorService {
    pub fn new(cache: SchemaCacheService) -> Self {
        Self { cache }
    }

    pub async fn validate_connection(
        &self,
        connection_id: &str,
        entity_type: Option<&str>,
        relational: Option<&RelationalSchema>,
    ) -> SchemaResult<ValidationResult> {
        let mappings = match entity_type {
            Some(entity) => self.cache.load_entity_mappings(connection_id, entity).await?,
            None => self.cache.load_mappings(connection_id).await?,
        };
        let remote = self.cache.load_remote_schema(connection_id).await?;
        Ok(validate(&mappings, relational, remote.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldCategory;
    use crate::services::relational_schema::DatabaseTable;
    use serde_json::json;

    fn remote() -> RemoteSchema {
        let mut schema = RemoteSchema::default();
        schema.resources.insert(
            "Product".to_string(),
            vec![
                RemoteField::scalar("id", "ID"),
                RemoteField::scalar("title", "String"),
                RemoteField::scalar("totalInventory", "Int"),
                RemoteField::scalar("createdAt", "DateTime"),
                RemoteField::scalar("status", "ProductStatus").with_kind(FieldKind::Enum),
                RemoteField::object("seo", "SEO", FieldCategory::ObjectType),
                RemoteField::object("variants", "ProductVariantConnection", FieldCategory::Connection),
            ],
        );
        schema.object_types.insert(
            "SEO".to_string(),
            vec![RemoteField::scalar("title", "String")],
        );
        schema.metafield_definitions.insert(
            "Product".to_string(),
            vec![MetafieldDefinition {
                namespace: "custom".to_string(),
                key: "material".to_string(),
                value_type: Some("single_line_text_field".to_string()),
            }],
        );
        schema
    }

    fn relational() -> RelationalSchema {
        RelationalSchema::new(vec![
            DatabaseTable::new(
                "products",
                vec![
                    DatabaseColumn::new("id", "varchar", false),
                    DatabaseColumn::new("title", "varchar", true).with_max_length(100),
                    DatabaseColumn::new("description", "text", true),
                    DatabaseColumn::new("stock", "integer", true),
                    DatabaseColumn::new("created_at", "timestamp with time zone", true),
                    DatabaseColumn::new("active", "boolean", true),
                    DatabaseColumn::new("attributes", "jsonb", true),
                ],
            ),
            DatabaseTable::new(
                "vendors",
                vec![
                    DatabaseColumn::new("name", "text", true),
                    DatabaseColumn::new("code", "text", true),
                ],
            ),
        ])
    }

    fn check(mapping: FieldMapping) -> ValidationResult {
        validate(&[mapping], Some(&relational()), Some(&remote()))
    }

    fn error_codes(result: &ValidationResult) -> Vec<IssueCode> {
        result.errors.iter().map(|issue| issue.code).collect()
    }

    fn warning_codes(result: &ValidationResult) -> Vec<IssueCode> {
        result.warnings.iter().map(|issue| issue.code).collect()
    }

    #[test]
    fn test_all_category_pairs() {
        use Compatibility::*;
        use TypeCategory::*;
        // Rows: source, columns: target, both in TypeCategory::ALL order
        let expected = [
            [Compatible, Coercion, Incompatible, Coercion, Incompatible, Unverified],
            [Compatible, Compatible, Incompatible, Incompatible, Incompatible, Unverified],
            [Incompatible, Incompatible, Compatible, Incompatible, Incompatible, Unverified],
            [Compatible, Incompatible, Incompatible, Compatible, Incompatible, Unverified],
            [Serialization, Incompatible, Incompatible, Incompatible, Compatible, Unverified],
            [Unverified, Unverified, Unverified, Unverified, Unverified, Unverified],
        ];
        let mut checked = 0;
        for (i, source) in TypeCategory::ALL.iter().enumerate() {
            for (j, target) in TypeCategory::ALL.iter().enumerate() {
                assert_eq!(
                    compatibility(*source, *target),
                    expected[i][j],
                    "{:?} -> {:?}",
                    source,
                    target
                );
                checked += 1;
            }
        }
        assert_eq!(checked, 36);
        assert_eq!(compatibility(String, Number), Coercion);
        assert_eq!(compatibility(Number, String), Compatible);
    }

    #[test]
    fn test_type_normalization() {
        assert_eq!(TypeCategory::from_sql_type("VARCHAR(255)"), TypeCategory::String);
        assert_eq!(TypeCategory::from_sql_type("character varying"), TypeCategory::String);
        assert_eq!(TypeCategory::from_sql_type("double precision"), TypeCategory::Number);
        assert_eq!(TypeCategory::from_sql_type("datetime2"), TypeCategory::Datetime);
        assert_eq!(TypeCategory::from_sql_type("geometry"), TypeCategory::Unknown);
        assert_eq!(
            TypeCategory::from_remote_type("Money", FieldKind::Scalar),
            TypeCategory::Number
        );
        assert_eq!(
            TypeCategory::from_remote_type("ProductStatus", FieldKind::Enum),
            TypeCategory::String
        );
        assert_eq!(
            TypeCategory::from_metafield_type(Some("list.single_line_text_field")),
            TypeCategory::Json
        );
    }

    #[test]
    fn test_missing_schemas_are_reported_not_thrown() {
        let mappings = vec![FieldMapping::new("Product", "title", "products", "title")];
        let result = validate(&mappings, None, None);
        assert!(!result.valid);
        assert_eq!(
            error_codes(&result),
            vec![IssueCode::MissingRemoteSchema, IssueCode::MissingRelationalSchema]
        );
        assert_eq!(
            warning_codes(&result),
            vec![IssueCode::Unverifiable, IssueCode::Unverifiable]
        );
    }

    #[test]
    fn test_validation_is_deterministic() {
        let mappings = vec![
            FieldMapping::new("Product", "title", "products", "title"),
            FieldMapping::new("Product", "missing", "products", "title"),
            FieldMapping::new("Product", "createdAt", "products", "stock"),
            FieldMapping::new("Product", "seo.title", "nowhere", "x"),
        ];
        let first = validate(&mappings, Some(&relational()), Some(&remote()));
        let second = validate(&mappings, Some(&relational()), Some(&remote()));
        assert_eq!(first, second);
        assert_eq!(first.stats.total_mappings, 4);
        assert_eq!(first.stats.mappings_with_errors, 2);
        assert_eq!(first.stats.incompatible_mappings, 1);
    }

    #[test]
    fn test_compatible_mappings_and_warnings() {
        let result = check(FieldMapping::new("Product", "description", "products", "description"));
        assert_eq!(error_codes(&result), vec![IssueCode::UnknownSourceField]);

        let result = check(FieldMapping::new("product", "SEO.Title", "PRODUCTS", "Description"));
        assert!(result.valid);
        assert!(result.warnings.is_empty());

        let result = check(FieldMapping::new("Product", "title", "products", "title"));
        assert!(result.valid);
        assert_eq!(warning_codes(&result), vec![IssueCode::Truncation]);

        let result = check(FieldMapping::new("Product", "totalInventory", "products", "title"));
        assert!(result.valid);
        assert!(result.warnings.is_empty());

        let result = check(FieldMapping::new("Product", "title", "products", "stock"));
        assert_eq!(warning_codes(&result), vec![IssueCode::TypeCoercion]);
        assert_eq!(
            result.warnings[0].suggested_transform,
            Some(Transform::Coerce {
                target_type: "number".to_string()
            })
        );

        let result = check(FieldMapping::new("Product", "createdAt", "products", "active"));
        assert!(result.valid);
        assert_eq!(warning_codes(&result), vec![IssueCode::IncompatibleTypes]);
        assert_eq!(result.stats.incompatible_mappings, 1);

        let result = check(FieldMapping::new("Product", "seo", "products", "description"));
        assert_eq!(warning_codes(&result), vec![IssueCode::TypeSerialization]);
    }

    #[test]
    fn test_not_nullable_target_suggests_default() {
        let result = check(FieldMapping::new("Product", "id", "products", "id").protected());
        assert!(result.valid);
        assert_eq!(warning_codes(&result), vec![IssueCode::NotNullable]);
        assert_eq!(
            result.warnings[0].suggested_transform,
            Some(Transform::Default {
                value: serde_json::Value::Null,
                only_if_null: true
            })
        );

        let with_default = FieldMapping::new("Product", "id", "products", "id").with_transform(
            Transform::Default {
                value: json!("n/a"),
                only_if_null: true,
            },
        );
        assert!(check(with_default).warnings.is_empty());
    }

    #[test]
    fn test_source_resolution_errors() {
        let result = check(FieldMapping::new("Widget", "id", "products", "id"));
        assert_eq!(error_codes(&result), vec![IssueCode::UnknownEntity]);

        let result = check(FieldMapping::new("Product", "variants", "products", "attributes"));
        assert_eq!(error_codes(&result), vec![IssueCode::ReadonlySource]);

        let result = check(FieldMapping::new("Product", "title", "products", "subtitle"));
        assert_eq!(error_codes(&result), vec![IssueCode::UnknownColumn]);

        let mut untargeted = FieldMapping::new("Product", "title", "products", "title");
        untargeted.target_column = None;
        assert_eq!(error_codes(&check(untargeted)), vec![IssueCode::MissingTarget]);
    }

    #[test]
    fn test_metafield_paths() {
        let result = check(FieldMapping::new(
            "Product",
            "metafields.custom.material",
            "products",
            "description",
        ));
        assert!(result.valid);

        let result = check(FieldMapping::new(
            "Product",
            "metafields.custom.fabric",
            "products",
            "description",
        ));
        assert_eq!(error_codes(&result), vec![IssueCode::UnknownMetafield]);
    }

    #[test]
    fn test_multi_source_resolves_each_entry() {
        let mapping = FieldMapping::new("Product", "title", "products", "description")
            .with_sources(&["title", "status", "vendor"])
            .with_transform(Transform::Template {
                template: "{title} ({status})".to_string(),
            });
        let result = check(mapping);
        assert_eq!(error_codes(&result), vec![IssueCode::UnknownSourceField]);
        assert!(result.errors[0].message.contains("vendor"));
    }

    #[test]
    fn test_transform_validation() {
        let expression = |formula: &str| {
            FieldMapping::new("Product", "title", "products", "description").with_transform(
                Transform::Expression {
                    formula: formula.to_string(),
                },
            )
        };
        let result = check(expression("shout(title)"));
        assert_eq!(error_codes(&result), vec![IssueCode::InvalidTransform]);
        assert!(result.errors[0].message.contains("shout"));

        let result = check(expression("upper(title) + ' ' + unknownField"));
        assert!(result.valid);
        assert!(warning_codes(&result).contains(&IssueCode::UnresolvedReference));

        let result = check(
            FieldMapping::new("Product", "title", "products", "description").with_transform(
                Transform::Template {
                    template: "static text".to_string(),
                },
            ),
        );
        assert_eq!(error_codes(&result), vec![IssueCode::InvalidTransform]);

        let result = check(
            FieldMapping::new("Product", "title", "products", "description").with_transform(
                Transform::Coerce {
                    target_type: "money".to_string(),
                },
            ),
        );
        assert_eq!(error_codes(&result), vec![IssueCode::InvalidTransform]);

        let lookup = |table: &str, column: &str| {
            FieldMapping::new("Product", "title", "products", "description").with_transform(
                Transform::Lookup {
                    table: table.to_string(),
                    match_column: "name".to_string(),
                    return_column: column.to_string(),
                },
            )
        };
        assert!(check(lookup("vendors", "code")).valid);
        assert_eq!(
            error_codes(&check(lookup("vendors", "slug"))),
            vec![IssueCode::InvalidTransform]
        );
        assert_eq!(
            error_codes(&check(lookup("suppliers", "code"))),
            vec![IssueCode::InvalidTransform]
        );
    }

    #[test]
    fn test_duplicates_and_disabled_protected() {
        let mappings = vec![
            FieldMapping::new("Product", "title", "products", "title"),
            FieldMapping::new("Product", "title", "products", "description"),
            FieldMapping::new("Product", "id", "products", "id")
                .protected()
                .disabled(),
            FieldMapping::new("Product", "seo.title", "nowhere", "x").disabled(),
        ];
        let result = validate(&mappings, Some(&relational()), Some(&remote()));
        assert_eq!(
            error_codes(&result),
            vec![IssueCode::DuplicateMapping, IssueCode::ProtectedDisabled]
        );
        assert_eq!(result.stats.enabled_mappings, 1);
    }
}
