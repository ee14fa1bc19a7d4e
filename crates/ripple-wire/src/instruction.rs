//! Wire instructions and durable values
//!
//! The shapes here are the stable wire contract. Entities travel as uids,
//! attributes as `{ident, schema}` so a receiver can define them on read,
//! entity types as idents.

use serde::{Deserialize, Serialize};

use ripple_core::{AttributeSchema, Uid};

/// Attribute keyed by ident, carrying its schema
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DurableAttribute {
    pub ident: String,
    pub schema: AttributeSchema,
}

impl DurableAttribute {
    pub fn new(ident: impl Into<String>, schema: AttributeSchema) -> Self {
        DurableAttribute {
            ident: ident.into(),
            schema,
        }
    }
}

/// Durable value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DurableValue {
    /// Reference to an entity by uid
    EntityRef(Uid),
    /// Reference to an entity type by ident
    EntityTypeRef(String),
    /// Scalar
    Scalar(serde_json::Value),
}

/// Index query keyed by durable identifiers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum DurableQuery {
    Column {
        attribute: DurableAttribute,
    },
    Contains {
        entity: Uid,
        attribute: DurableAttribute,
        value: DurableValue,
    },
    Entity {
        entity: Uid,
    },
    GetOne {
        entity: Uid,
        attribute: DurableAttribute,
    },
    GetMany {
        entity: Uid,
        attribute: DurableAttribute,
    },
    LookupMany {
        attribute: DurableAttribute,
        value: DurableValue,
    },
    LookupUnique {
        attribute: DurableAttribute,
        value: DurableValue,
    },
    RefsTo {
        target: Uid,
    },
}

/// Fact keyed by durable identifiers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableFact {
    pub entity: Uid,
    pub attribute: DurableAttribute,
    pub value: DurableValue,
    pub added: bool,
}

impl DurableFact {
    /// The fact that undoes this one
    pub fn inverse(&self) -> DurableFact {
        DurableFact {
            added: !self.added,
            ..self.clone()
        }
    }
}

/// Wire instruction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireInstruction {
    CreateEntity {
        seed: u64,
        uid: Uid,
        entity_type: String,
        attributes: Vec<(DurableAttribute, DurableValue)>,
    },
    Add {
        seed: u64,
        entity: Uid,
        attribute: DurableAttribute,
        value: DurableValue,
    },
    Remove {
        seed: u64,
        entity: Uid,
        attribute: DurableAttribute,
        value: DurableValue,
    },
    RetractAttribute {
        seed: u64,
        entity: Uid,
        attribute: DurableAttribute,
    },
    RetractEntity {
        seed: u64,
        entity: Uid,
    },
    AtomicComposite {
        seed: u64,
        instructions: Vec<WireInstruction>,
    },
    Validate {
        seed: u64,
        queries: Vec<DurableQuery>,
        hash: u64,
    },
}

impl WireInstruction {
    pub fn seed(&self) -> u64 {
        match self {
            WireInstruction::CreateEntity { seed, .. }
            | WireInstruction::Add { seed, .. }
            | WireInstruction::Remove { seed, .. }
            | WireInstruction::RetractAttribute { seed, .. }
            | WireInstruction::RetractEntity { seed, .. }
            | WireInstruction::AtomicComposite { seed, .. }
            | WireInstruction::Validate { seed, .. } => *seed,
        }
    }

    pub fn is_validate(&self) -> bool {
        matches!(self, WireInstruction::Validate { .. })
    }

    /// Copy with every Validate removed, recursively
    ///
    /// Returns `None` for a Validate or a composite left empty.
    pub fn without_validations(&self) -> Option<WireInstruction> {
        match self {
            WireInstruction::Validate { .. } => None,
            WireInstruction::AtomicComposite { seed, instructions } => {
                let kept: Vec<WireInstruction> = instructions
                    .iter()
                    .filter_map(WireInstruction::without_validations)
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(WireInstruction::AtomicComposite {
                        seed: *seed,
                        instructions: kept,
                    })
                }
            }
            other => Some(other.clone()),
        }
    }
}
