//! Schema - attributes and entity types addressed by stable idents
//!
//! Schema is append-only: an ident, once defined, keeps its id and its
//! definition for the lifetime of the store.

use std::collections::HashMap;

use ripple_core::{AttributeSchema, EntityId, RippleError, RippleResult};

/// Built-in: ident of a schema entity
pub const DB_IDENT: EntityId = EntityId(0x0300_0000_0000_0001);
/// Built-in: entity type reference (card one)
pub const ENTITY_TYPE: EntityId = EntityId(0x0300_0000_0000_0002);
/// Built-in: durable uid (unique string, card one)
pub const ENTITY_UID: EntityId = EntityId(0x0300_0000_0000_0003);

pub const DB_IDENT_IDENT: &str = "db/ident";
pub const ENTITY_TYPE_IDENT: &str = "entity/type";
pub const ENTITY_UID_IDENT: &str = "entity/uid";

/// Attribute definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeDef {
    pub ident: String,
    pub schema: AttributeSchema,
}

/// What an ident names
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaEntry {
    Attribute(EntityId),
    EntityType(EntityId),
}

impl SchemaEntry {
    pub fn id(self) -> EntityId {
        match self {
            SchemaEntry::Attribute(id) | SchemaEntry::EntityType(id) => id,
        }
    }
}

/// Schema registry
#[derive(Clone, Debug)]
pub struct Schema {
    attributes: HashMap<EntityId, AttributeDef>,
    entity_types: HashMap<EntityId, String>,
    idents: HashMap<String, SchemaEntry>,
}

impl Schema {
    /// Schema with the built-in attributes installed
    pub fn new() -> Self {
        let mut schema = Schema {
            attributes: HashMap::new(),
            entity_types: HashMap::new(),
            idents: HashMap::new(),
        };
        schema.install(DB_IDENT, DB_IDENT_IDENT, AttributeSchema::scalar());
        schema.install(ENTITY_TYPE, ENTITY_TYPE_IDENT, AttributeSchema::reference());
        schema.install(ENTITY_UID, ENTITY_UID_IDENT, AttributeSchema::scalar().unique());
        schema
    }

    fn install(&mut self, id: EntityId, ident: &str, schema: AttributeSchema) {
        self.attributes.insert(
            id,
            AttributeDef {
                ident: ident.to_string(),
                schema,
            },
        );
        self.idents
            .insert(ident.to_string(), SchemaEntry::Attribute(id));
    }

    /// Get an attribute definition by id
    pub fn attribute(&self, id: EntityId) -> Option<&AttributeDef> {
        self.attributes.get(&id)
    }

    /// Get an attribute definition, failing on unknown ids
    pub fn require_attribute(&self, id: EntityId) -> RippleResult<&AttributeDef> {
        self.attributes
            .get(&id)
            .ok_or_else(|| RippleError::UnknownAttribute(format!("{:?}", id)))
    }

    /// Get an attribute id by ident
    pub fn attribute_by_ident(&self, ident: &str) -> Option<EntityId> {
        match self.idents.get(ident) {
            Some(SchemaEntry::Attribute(id)) => Some(*id),
            _ => None,
        }
    }

    /// Get an entity type id by ident
    pub fn entity_type_by_ident(&self, ident: &str) -> Option<EntityId> {
        match self.idents.get(ident) {
            Some(SchemaEntry::EntityType(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn is_entity_type(&self, id: EntityId) -> bool {
        self.entity_types.contains_key(&id)
    }

    /// Ident of an attribute or entity type
    pub fn ident_of(&self, id: EntityId) -> Option<&str> {
        self.attributes
            .get(&id)
            .map(|def| def.ident.as_str())
            .or_else(|| self.entity_types.get(&id).map(String::as_str))
    }

    pub(crate) fn lookup(&self, ident: &str) -> Option<SchemaEntry> {
        self.idents.get(ident).copied()
    }

    pub(crate) fn insert_attribute(&mut self, id: EntityId, ident: &str, schema: AttributeSchema) {
        self.install(id, ident, schema);
    }

    pub(crate) fn insert_entity_type(&mut self, id: EntityId, ident: &str) {
        self.entity_types.insert(id, ident.to_string());
        self.idents
            .insert(ident.to_string(), SchemaEntry::EntityType(id));
    }

    /// Iterate over all attributes
    pub fn attributes(&self) -> impl Iterator<Item = (EntityId, &AttributeDef)> {
        self.attributes.iter().map(|(id, def)| (*id, def))
    }

    /// Number of idents defined
    pub fn len(&self) -> usize {
        self.idents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idents.is_empty()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}
