//! Durable conversion - ephemeral ids to uids and idents, and back

use std::collections::HashMap;

use ripple_core::{EntityId, Fact, Novelty, Partition, RippleError, RippleResult, Uid, Value};
use ripple_store::{Db, ENTITY_UID, ENTITY_UID_IDENT};
use ripple_wire::{DurableAttribute, DurableFact, DurableValue};

/// Durable form of an attribute
pub fn durable_attribute(db: &Db, attribute: EntityId) -> RippleResult<DurableAttribute> {
    let def = db.schema().require_attribute(attribute)?;
    Ok(DurableAttribute::new(def.ident.clone(), def.schema))
}

/// Durable form of a value
pub fn durable_value(db: &Db, value: &Value) -> RippleResult<DurableValue> {
    durable_value_in(db, value, &HashMap::new())
}

fn durable_value_in(db: &Db, value: &Value, uids: &HashMap<EntityId, Uid>) -> RippleResult<DurableValue> {
    match value {
        Value::Ref(target) => {
            if db.schema().is_entity_type(*target) {
                let ident = db
                    .schema()
                    .ident_of(*target)
                    .ok_or_else(|| RippleError::UnknownEntityType(format!("{:?}", target)))?;
                return Ok(DurableValue::EntityTypeRef(ident.to_string()));
            }
            uids.get(target)
                .copied()
                .or_else(|| db.uid_of(*target))
                .map(DurableValue::EntityRef)
                .ok_or(RippleError::MissingUid(*target))
        }
        scalar => scalar
            .to_json()
            .map(DurableValue::Scalar)
            .ok_or_else(|| RippleError::UnsupportedValue(format!("{:?}", scalar))),
    }
}

/// Durable form of a fact
pub fn durable_fact(db: &Db, fact: &Fact) -> RippleResult<DurableFact> {
    durable_fact_in(db, fact, &HashMap::new())
}

fn durable_fact_in(db: &Db, fact: &Fact, uids: &HashMap<EntityId, Uid>) -> RippleResult<DurableFact> {
    let entity = uids
        .get(&fact.entity)
        .copied()
        .or_else(|| db.uid_of(fact.entity))
        .ok_or(RippleError::MissingUid(fact.entity))?;
    Ok(DurableFact {
        entity,
        attribute: durable_attribute(db, fact.attribute)?,
        value: durable_value_in(db, &fact.value, uids)?,
        added: fact.added,
    })
}

/// Shared part of a novelty in durable form
///
/// Uids are taken from uid facts inside the novelty before the store, so
/// retractions of whole entities still convert after they were applied.
/// Facts that cannot be made durable are skipped.
pub fn durable_novelty(db: &Db, novelty: &Novelty) -> Vec<DurableFact> {
    let uids: HashMap<EntityId, Uid> = novelty
        .iter()
        .filter(|f| f.attribute == ENTITY_UID)
        .filter_map(|f| f.value.as_str().and_then(Uid::parse).map(|uid| (f.entity, uid)))
        .collect();

    novelty
        .iter()
        .filter(|f| f.entity.is_shared())
        .filter_map(|f| durable_fact_in(db, f, &uids).ok())
        .collect()
}

/// Every fact of the Shared partition in durable form
///
/// Fails with `MissingUid` when a Shared entity carries no uid.
pub fn shared_snapshot(db: &Db) -> RippleResult<Vec<DurableFact>> {
    let mut facts = Vec::new();
    for entity in db.entities_in(Partition::Shared) {
        if db.uid_of(entity).is_none() {
            return Err(RippleError::MissingUid(entity));
        }
        for fact in db.facts_of(entity) {
            facts.push(durable_fact(db, &fact)?);
        }
    }
    Ok(facts)
}

/// Apply durable facts to a store without constraint checks
///
/// Entities are created for uid assertions first so facts can refer to
/// entities introduced later in the batch. Facts on entities that remain
/// unknown are skipped.
pub fn apply_durable(db: &mut Db, facts: &[DurableFact], resolver: &mut Resolver) -> RippleResult<Novelty> {
    for fact in facts {
        if fact.added && fact.attribute.ident == ENTITY_UID_IDENT {
            resolver.entity_or_create(db, fact.entity);
        }
    }

    let mut local = Vec::with_capacity(facts.len());
    for fact in facts {
        if let Some(f) = resolver.fact(db, fact)? {
            local.push(f);
        }
    }
    Ok(db.apply_datoms(&local))
}

/// Resolves durable identifiers against a store, creating what is missing
///
/// Entities allocated here are remembered so a batch that creates an
/// entity and then refers to it resolves to one id.
#[derive(Debug, Default)]
pub struct Resolver {
    created: HashMap<Uid, EntityId>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver::default()
    }

    /// Resolver that reuses ids already assigned to these uids
    pub fn with_entities(known: impl IntoIterator<Item = (Uid, EntityId)>) -> Self {
        Resolver {
            created: known.into_iter().collect(),
        }
    }

    /// Known entity for a uid
    pub fn entity(&self, db: &Db, uid: Uid) -> Option<EntityId> {
        db.entity_by_uid(uid)
            .or_else(|| self.created.get(&uid).copied())
    }

    /// Known entity for a uid, or a fresh Shared id
    pub fn entity_or_create(&mut self, db: &mut Db, uid: Uid) -> EntityId {
        if let Some(id) = self.entity(db, uid) {
            return id;
        }
        let id = db.allocate(Partition::Shared);
        self.created.insert(uid, id);
        id
    }

    /// Attribute id, defining it on first sight
    pub fn attribute(&self, db: &mut Db, attribute: &DurableAttribute) -> RippleResult<EntityId> {
        db.ensure_attribute(&attribute.ident, attribute.schema)
    }

    /// Local value; `None` for a reference to an unknown entity
    pub fn value(&self, db: &mut Db, value: &DurableValue) -> RippleResult<Option<Value>> {
        match value {
            DurableValue::EntityRef(uid) => Ok(self.entity(db, *uid).map(Value::Ref)),
            DurableValue::EntityTypeRef(ident) => Ok(Some(Value::Ref(db.ensure_entity_type(ident)?))),
            DurableValue::Scalar(json) => Value::from_json(json).map(Some),
        }
    }

    /// Local fact; `None` when its entity or referenced entity is unknown
    pub fn fact(&self, db: &mut Db, fact: &DurableFact) -> RippleResult<Option<Fact>> {
        let attribute = self.attribute(db, &fact.attribute)?;
        let entity = match self.entity(db, fact.entity) {
            Some(entity) => entity,
            None => return Ok(None),
        };
        let value = match self.value(db, &fact.value)? {
            Some(value) => value,
            None => return Ok(None),
        };
        Ok(Some(Fact {
            entity,
            attribute,
            value,
            tx: 0,
            added: fact.added,
        }))
    }
}
