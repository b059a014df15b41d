use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::errors::SchemaResult;
use crate::schema::{catalog, FieldKind, FieldMapping, RemoteEntity, RemoteField};
use crate::services::schema_cache::SchemaCacheService;

pub const ENTITY_SPACING_X: i32 = 420;
pub const SUBFIELD_INDENT_X: i32 = 40;
pub const FIELD_OFFSET_Y: i32 = 120;
pub const FIELD_SPACING_Y: i32 = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Entity,
    Field,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    EntityToField,
    FieldToSubfield,
    FieldToEntity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMapping {
    pub target_table: Option<String>,
    pub target_column: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaNode {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    pub entity_type: String,
    /// Empty for entity nodes
    pub field_path: String,
    pub depth: u8,
    pub kind: Option<FieldKind>,
    pub base_type: Option<String>,
    pub is_relationship: bool,
    pub is_protected: bool,
    pub readonly: bool,
    pub mapped: bool,
    pub mapping: Option<NodeMapping>,
    pub position: Position,
}

impl SchemaNode {
    pub fn full_path(&self) -> String {
        format!("{}.{}", self.entity_type, self.field_path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub entity_count: usize,
    pub field_count: usize,
    pub relationship_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaGraph {
    pub nodes: Vec<SchemaNode>,
    pub edges: Vec<SchemaEdge>,
    pub summary: GraphSummary,
}

pub fn entity_node_id(entity: &str) -> String {
    format!("entity:{}", entity)
}

pub fn field_node_id(entity: &str, field_path: &str) -> String {
    format!("field:{}.{}", entity, field_path)
}

/// Read-side graph view over the schema cache, used to configure mappings.
#[derive(Clone)]
pub struct SchemaGraphService {
    cache: SchemaCacheService,
}

impl SchemaGraphService {
    pub fn new(cache: SchemaCacheService) -> Self {
        Self { cache }
    }

    /// `None` when introspection has not run for the connection yet.
    pub async fn build_graph(&self, connection_id: &str) -> SchemaResult<Option<SchemaGraph>> {
        if self.cache.is_empty(connection_id).await? {
            debug!("Schema cache empty for {}", connection_id);
            return Ok(None);
        }

        let mut entities = Vec::new();
        for entity in catalog::known_entities() {
            if let Some(fields) = self
                .cache
                .load_entity_fields(connection_id, entity.name)
                .await?
            {
                entities.push((entity, fields));
            }
        }
        let object_types = self.cache.load_object_types(connection_id).await?;
        let mappings = self.cache.load_mappings(connection_id).await?;

        let graph = build_schema_graph(&entities, &object_types, &mappings);
        debug!(
            entities = graph.summary.entity_count,
            fields = graph.summary.field_count,
            relationships = graph.summary.relationship_count,
            "Built schema graph for {}",
            connection_id
        );
        Ok(Some(graph))
    }
}

/// Builds nodes, then derives edges from the node set.
pub fn build_schema_graph(
    entities: &[(&RemoteEntity, Vec<RemoteField>)],
    object_types: &HashMap<String, Vec<RemoteField>>,
    mappings: &[FieldMapping],
) -> SchemaGraph {
    let present: HashSet<&str> = entities.iter().map(|(entity, _)| entity.name).collect();
    let mappings_by_path: HashMap<&str, &FieldMapping> = mappings
        .iter()
        .map(|m| (m.full_path.as_str(), m))
        .collect();

    let mut nodes = Vec::new();
    for (entity_index, (entity, fields)) in entities.iter().enumerate() {
        let x = entity_index as i32 * ENTITY_SPACING_X;
        nodes.push(SchemaNode {
            id: entity_node_id(entity.name),
            node_type: NodeType::Entity,
            label: entity.display_name.to_string(),
            entity_type: entity.name.to_string(),
            field_path: String::new(),
            depth: 0,
            kind: None,
            base_type: None,
            is_relationship: false,
            is_protected: false,
            readonly: false,
            mapped: false,
            mapping: None,
            position: Position { x, y: 0 },
        });

        let mut row = 0;
        for field in fields.iter().filter(|f| !f.category.is_hidden()) {
            let names_entity = catalog::is_known_entity(&field.base_type);
            nodes.push(field_node(
                entity,
                &field.name,
                field,
                1,
                names_entity && present.contains(field.base_type.as_str()),
                &mappings_by_path,
                Position {
                    x,
                    y: FIELD_OFFSET_Y + row * FIELD_SPACING_Y,
                },
            ));
            row += 1;

            let expandable = field.kind == FieldKind::Object
                && !field.is_connection_wrapper()
                && !names_entity;
            if !expandable {
                continue;
            }
            let Some(sub_fields) = object_types.get(&field.base_type) else {
                continue;
            };
            for sub in sub_fields
                .iter()
                .filter(|s| s.kind.is_leaf() && !s.category.is_hidden())
            {
                let path = format!("{}.{}", field.name, sub.name);
                nodes.push(field_node(
                    entity,
                    &path,
                    sub,
                    2,
                    false,
                    &mappings_by_path,
                    Position {
                        x: x + SUBFIELD_INDENT_X,
                        y: FIELD_OFFSET_Y + row * FIELD_SPACING_Y,
                    },
                ));
                row += 1;
            }
        }
    }

    let edges = build_edges(&nodes);
    let summary = GraphSummary {
        entity_count: nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Entity)
            .count(),
        field_count: nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Field)
            .count(),
        relationship_count: edges
            .iter()
            .filter(|e| e.kind == EdgeKind::FieldToEntity)
            .count(),
    };

    SchemaGraph {
        nodes,
        edges,
        summary,
    }
}

fn field_node(
    entity: &RemoteEntity,
    path: &str,
    field: &RemoteField,
    depth: u8,
    is_relationship: bool,
    mappings: &HashMap<&str, &FieldMapping>,
    position: Position,
) -> SchemaNode {
    let full_path = format!("{}.{}", entity.name, path);
    let mapping = mappings.get(full_path.as_str()).map(|m| NodeMapping {
        target_table: m.target_table.clone(),
        target_column: m.target_column.clone(),
        enabled: m.enabled,
    });

    SchemaNode {
        id: field_node_id(entity.name, path),
        node_type: NodeType::Field,
        label: field.name.clone(),
        entity_type: entity.name.to_string(),
        field_path: path.to_string(),
        depth,
        kind: Some(field.kind),
        base_type: Some(field.base_type.clone()),
        is_relationship,
        is_protected: entity.is_protected(path),
        readonly: field.category.is_readonly(),
        mapped: mapping.as_ref().map(|m| m.enabled).unwrap_or(false),
        mapping,
        position,
    }
}

fn build_edges(nodes: &[SchemaNode]) -> Vec<SchemaEdge> {
    let entity_ids: HashSet<&str> = nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Entity)
        .map(|n| n.id.as_str())
        .collect();

    let mut edges = Vec::new();
    let mut push = |source: &str, target: &str, kind: EdgeKind| {
        edges.push(SchemaEdge {
            id: format!("{}->{}", source, target),
            source: source.to_string(),
            target: target.to_string(),
            kind,
        });
    };

    for node in nodes.iter().filter(|n| n.node_type == NodeType::Field) {
        if node.depth == 1 {
            push(
                &entity_node_id(&node.entity_type),
                &node.id,
                EdgeKind::EntityToField,
            );
        } else {
            let parent = nodes.iter().find(|candidate| {
                candidate.node_type == NodeType::Field
                    && candidate.depth == 1
                    && candidate.entity_type == node.entity_type
                    && node
                        .field_path
                        .strip_prefix(candidate.field_path.as_str())
                        .map(|rest| rest.starts_with('.'))
                        .unwrap_or(false)
            });
            if let Some(parent) = parent {
                push(&parent.id, &node.id, EdgeKind::FieldToSubfield);
            }
        }

        if node.is_relationship {
            if let Some(target) = node.base_type.as_deref().map(entity_node_id) {
                if entity_ids.contains(target.as_str()) {
                    push(&node.id, &target, EdgeKind::FieldToEntity);
                }
            }
        }
    }

    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_utils::setup_test_db;
    use crate::schema::{find_entity, CacheCategory, FieldCategory};

    fn product_fields() -> Vec<RemoteField> {
        vec![
            RemoteField::scalar("id", "ID"),
            RemoteField::scalar("title", "String"),
            RemoteField::scalar("handle", "String"),
            RemoteField::object("seo", "SEO", FieldCategory::ObjectType),
            RemoteField::object("collection", "Collection", FieldCategory::Entity),
            RemoteField::object("variants", "ProductVariantConnection", FieldCategory::Connection),
            RemoteField::object("metafield", "Metafield", FieldCategory::Metafield),
            RemoteField::scalar("contextualPricing", "Money").with_category(FieldCategory::Contextual),
            RemoteField::object("featuredMedia", "Media", FieldCategory::Polymorphic),
        ]
    }

    fn object_types() -> HashMap<String, Vec<RemoteField>> {
        let mut types = HashMap::new();
        types.insert(
            "SEO".to_string(),
            vec![
                RemoteField::scalar("title", "String"),
                RemoteField::scalar("description", "String"),
                RemoteField::object("image", "Image", FieldCategory::ObjectType),
            ],
        );
        types
    }

    fn graph_with(entities: &[&str]) -> SchemaGraph {
        let mut input = Vec::new();
        for name in entities {
            let entity = find_entity(name).unwrap();
            let fields = if *name == "Product" {
                product_fields()
            } else {
                vec![RemoteField::scalar("id", "ID"), RemoteField::scalar("title", "String")]
            };
            input.push((entity, fields));
        }
        let mappings = vec![FieldMapping::new("Product", "seo.title", "products", "seo_title")];
        build_schema_graph(&input, &object_types(), &mappings)
    }

    #[test]
    fn test_summary_matches_nodes_and_edges() {
        let graph = graph_with(&["Product", "Collection"]);
        let entity_nodes = graph
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Entity)
            .count();
        let field_nodes = graph
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Field)
            .count();
        assert_eq!(graph.summary.entity_count, entity_nodes);
        assert_eq!(graph.summary.field_count, field_nodes);
        assert_eq!(graph.summary.relationship_count, 1);

        // Product: 7 visible depth-1 fields + 2 SEO scalars; Collection: 2 fields
        assert_eq!(entity_nodes, 2);
        assert_eq!(field_nodes, 11);
    }

    #[test]
    fn test_every_relationship_has_an_entity_edge() {
        for entities in [vec!["Product", "Collection"], vec!["Product"]] {
            let graph = graph_with(&entities);
            let entity_ids: HashSet<&str> = graph
                .nodes
                .iter()
                .filter(|n| n.node_type == NodeType::Entity)
                .map(|n| n.id.as_str())
                .collect();
            for node in graph.nodes.iter().filter(|n| n.is_relationship) {
                assert!(graph.edges.iter().any(|e| e.source == node.id
                    && e.kind == EdgeKind::FieldToEntity
                    && entity_ids.contains(e.target.as_str())));
            }
        }
        // Without the Collection node there is no relationship at all
        assert_eq!(graph_with(&["Product"]).summary.relationship_count, 0);
    }

    #[test]
    fn test_filtering_expansion_and_flags() {
        let graph = graph_with(&["Product", "Collection"]);
        let node = |path: &str| graph.nodes.iter().find(|n| n.full_path() == path);

        assert!(node("Product.metafield").is_none());
        assert!(node("Product.contextualPricing").is_none());
        assert!(node("Product.variants").unwrap().readonly);
        assert!(node("Product.featuredMedia").unwrap().readonly);
        assert!(node("Product.handle").unwrap().is_protected);
        assert!(!node("Product.title").unwrap().is_protected);

        // One level of expansion, scalar sub-fields only
        assert!(node("Product.seo.title").is_some());
        assert!(node("Product.seo.image").is_none());
        assert!(node("Product.variants.edges").is_none());

        let seo_title = node("Product.seo.title").unwrap();
        assert!(seo_title.mapped);
        assert_eq!(seo_title.depth, 2);
        assert!(graph.edges.iter().any(|e| e.source == "field:Product.seo"
            && e.target == seo_title.id
            && e.kind == EdgeKind::FieldToSubfield));
    }

    #[test]
    fn test_layout_is_grid() {
        let graph = graph_with(&["Product", "Collection"]);
        let find = |id: &str| graph.nodes.iter().find(|n| n.id == id).unwrap().position;
        assert_eq!(find("entity:Product"), Position { x: 0, y: 0 });
        assert_eq!(find("field:Product.id"), Position { x: 0, y: 120 });
        assert_eq!(find("field:Product.seo"), Position { x: 0, y: 288 });
        assert_eq!(find("field:Product.seo.title"), Position { x: 40, y: 344 });
        assert_eq!(find("entity:Collection"), Position { x: 420, y: 0 });
        assert_eq!(graph_with(&["Product", "Collection"]), graph);
    }

    #[tokio::test]
    async fn test_build_graph_from_cache() {
        let db = setup_test_db().await;
        let cache = SchemaCacheService::new(db);
        let service = SchemaGraphService::new(cache.clone());

        assert!(service.build_graph("shop-1").await.unwrap().is_none());

        cache
            .store_type("shop-1", CacheCategory::Entity, "Product", &product_fields())
            .await
            .unwrap();
        cache
            .store_type("shop-1", CacheCategory::ObjectType, "SEO", &object_types()["SEO"])
            .await
            .unwrap();

        let graph = service.build_graph("shop-1").await.unwrap().unwrap();
        assert_eq!(graph.summary.entity_count, 1);
        assert_eq!(graph.summary.field_count, 9);
        assert_eq!(graph.summary.relationship_count, 0);
    }
}
