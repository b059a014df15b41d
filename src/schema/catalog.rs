//! Fixed catalog of remote entities the engine knows how to sync.
//!
//! Entities are not discovered dynamically: the catalog decides which root
//! types are offered for mapping, which GraphQL connection pages them, and
//! which of their fields are protected system identifiers.

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Root query field returning a `<Name>Connection`.
    pub root_field: &'static str,
    pub protected_fields: &'static [&'static str],
}

impl RemoteEntity {
    pub fn is_protected(&self, field_path: &str) -> bool {
        self.protected_fields.contains(&field_path)
    }
}

static ENTITIES: &[RemoteEntity] = &[
    RemoteEntity {
        name: "Product",
        display_name: "Products",
        root_field: "products",
        protected_fields: &["id", "legacyResourceId", "handle"],
    },
    RemoteEntity {
        name: "ProductVariant",
        display_name: "Product Variants",
        root_field: "productVariants",
        protected_fields: &["id", "legacyResourceId", "sku"],
    },
    RemoteEntity {
        name: "Collection",
        display_name: "Collections",
        root_field: "collections",
        protected_fields: &["id", "legacyResourceId", "handle"],
    },
    RemoteEntity {
        name: "Customer",
        display_name: "Customers",
        root_field: "customers",
        protected_fields: &["id", "legacyResourceId"],
    },
    RemoteEntity {
        name: "Order",
        display_name: "Orders",
        root_field: "orders",
        protected_fields: &["id", "legacyResourceId"],
    },
    RemoteEntity {
        name: "Location",
        display_name: "Locations",
        root_field: "locations",
        protected_fields: &["id", "legacyResourceId"],
    },
    RemoteEntity {
        name: "InventoryItem",
        display_name: "Inventory Items",
        root_field: "inventoryItems",
        protected_fields: &["id", "legacyResourceId"],
    },
];

pub fn known_entities() -> &'static [RemoteEntity] {
    ENTITIES
}

pub fn find_entity(name: &str) -> Option<&'static RemoteEntity> {
    ENTITIES.iter().find(|entity| entity.name == name)
}

pub fn is_known_entity(name: &str) -> bool {
    find_entity(name).is_some()
}

/// Maps a webhook topic prefix such as `products` or `inventory_items` to its entity.
pub fn entity_for_topic(topic_resource: &str) -> Option<&'static RemoteEntity> {
    let normalized: String = topic_resource.split('_').collect();
    ENTITIES
        .iter()
        .find(|entity| entity.root_field.eq_ignore_ascii_case(&normalized))
}
