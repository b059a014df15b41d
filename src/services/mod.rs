pub mod mapping_validator;
pub mod relational_schema;
pub mod schema_cache;
pub mod schema_graph;

pub use mapping_validator::{validate, MappingValidatorService, ValidationResult};
pub use relational_schema::{DatabaseColumn, DatabaseTable, RelationalSchema};
pub use schema_cache::SchemaCacheService;
pub use schema_graph::{SchemaGraph, SchemaGraphService};
