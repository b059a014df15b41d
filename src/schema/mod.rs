//! Remote schema model: cached field definitions, the fixed entity catalog,
//! field mappings and the transforms attached to them.

pub mod catalog;
pub mod expression;
pub mod mapping;
pub mod transform;
pub mod types;

pub use catalog::{find_entity, known_entities, RemoteEntity};
pub use expression::Expression;
pub use mapping::{AccessStatus, FieldMapping, Transform};
pub use transform::{LookupSource, TransformEngine, TransformOutcome};
pub use types::{
    CacheCategory, FieldCategory, FieldKind, MetafieldDefinition, RemoteField, RemoteSchema,
};
