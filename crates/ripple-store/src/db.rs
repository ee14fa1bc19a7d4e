//! Fact store - indexes, id allocation and transactional apply

use std::collections::{BTreeMap, BTreeSet};

use ripple_core::{
    AttributeSchema, EntityId, Fact, Novelty, Partition, RippleError, RippleResult, Uid, Value,
};
use tracing::debug;

use crate::schema::{Schema, SchemaEntry, DB_IDENT, ENTITY_TYPE, ENTITY_UID};

/// First index handed out in the Common partition (lower ones are built-ins)
const COMMON_USER_START: u64 = 0x100;

/// Primitive mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Assert {
        entity: EntityId,
        attribute: EntityId,
        value: Value,
    },
    Retract {
        entity: EntityId,
        attribute: EntityId,
        value: Value,
    },
}

impl Op {
    pub fn assert(entity: EntityId, attribute: EntityId, value: impl Into<Value>) -> Self {
        Op::Assert {
            entity,
            attribute,
            value: value.into(),
        }
    }

    pub fn retract(entity: EntityId, attribute: EntityId, value: impl Into<Value>) -> Self {
        Op::Retract {
            entity,
            attribute,
            value: value.into(),
        }
    }

    pub fn entity(&self) -> EntityId {
        match self {
            Op::Assert { entity, .. } | Op::Retract { entity, .. } => *entity,
        }
    }
}

/// In-memory fact store
#[derive(Clone, Debug)]
pub struct Db {
    pub(crate) schema: Schema,
    /// entity → attribute → value → tx
    pub(crate) eav: BTreeMap<EntityId, BTreeMap<EntityId, BTreeMap<Value, u64>>>,
    /// attribute → value → entities
    pub(crate) ave: BTreeMap<EntityId, BTreeMap<Value, BTreeSet<EntityId>>>,
    /// referenced entity → (referencer, attribute)
    pub(crate) vae: BTreeMap<EntityId, BTreeSet<(EntityId, EntityId)>>,
    next: [u64; 4],
    basis: u64,
}

impl Db {
    pub fn new() -> Self {
        let mut next = [0u64; 4];
        next[Partition::Common.slot()] = COMMON_USER_START;
        Db {
            schema: Schema::new(),
            eav: BTreeMap::new(),
            ave: BTreeMap::new(),
            vae: BTreeMap::new(),
            next,
            basis: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Monotonic apply counter
    pub fn basis(&self) -> u64 {
        self.basis
    }

    /// Allocate a fresh id in a partition
    pub fn allocate(&mut self, partition: Partition) -> EntityId {
        let slot = &mut self.next[partition.slot()];
        *slot += 1;
        EntityId::new(partition, *slot)
    }

    /// Define an attribute, or return the existing one if identical
    pub fn ensure_attribute(&mut self, ident: &str, schema: AttributeSchema) -> RippleResult<EntityId> {
        match self.schema.lookup(ident) {
            Some(SchemaEntry::Attribute(id)) => {
                let def = self.schema.require_attribute(id)?;
                if def.schema == schema {
                    Ok(id)
                } else {
                    Err(RippleError::SchemaConflict(ident.to_string()))
                }
            }
            Some(SchemaEntry::EntityType(_)) => Err(RippleError::SchemaConflict(ident.to_string())),
            None => {
                let id = self.allocate(Partition::Schema);
                self.schema.insert_attribute(id, ident, schema);
                self.insert(id, DB_IDENT, Value::from(ident), self.basis);
                debug!("defined attribute {} as {:?}", ident, id);
                Ok(id)
            }
        }
    }

    /// Define an entity type, or return the existing one
    pub fn ensure_entity_type(&mut self, ident: &str) -> RippleResult<EntityId> {
        match self.schema.lookup(ident) {
            Some(SchemaEntry::EntityType(id)) => Ok(id),
            Some(SchemaEntry::Attribute(_)) => Err(RippleError::SchemaConflict(ident.to_string())),
            None => {
                let id = self.allocate(Partition::Schema);
                self.schema.insert_entity_type(id, ident);
                self.insert(id, DB_IDENT, Value::from(ident), self.basis);
                debug!("defined entity type {} as {:?}", ident, id);
                Ok(id)
            }
        }
    }

    /// Does the entity have any fact?
    pub fn exists(&self, entity: EntityId) -> bool {
        self.eav.contains_key(&entity)
    }

    /// Resolve a durable uid to the local id
    pub fn entity_by_uid(&self, uid: Uid) -> Option<EntityId> {
        self.lookup_unique(ENTITY_UID, &Value::Str(uid.to_string()))
    }

    /// Durable uid of an entity, if it carries one
    pub fn uid_of(&self, entity: EntityId) -> Option<Uid> {
        self.first_value(entity, ENTITY_UID)
            .and_then(|v| v.as_str().and_then(Uid::parse))
    }

    /// Entity type of an entity
    pub fn entity_type_of(&self, entity: EntityId) -> Option<EntityId> {
        self.first_value(entity, ENTITY_TYPE).and_then(|v| v.as_ref())
    }

    /// All facts of one entity
    pub fn facts_of(&self, entity: EntityId) -> Vec<Fact> {
        let mut facts = Vec::new();
        if let Some(attrs) = self.eav.get(&entity) {
            for (attribute, values) in attrs {
                for (value, tx) in values {
                    facts.push(Fact::assert(entity, *attribute, value.clone(), *tx));
                }
            }
        }
        facts
    }

    /// Unbounded scan over every fact in the store
    pub fn datoms(&self) -> impl Iterator<Item = Fact> + '_ {
        self.eav.iter().flat_map(|(entity, attrs)| {
            attrs.iter().flat_map(move |(attribute, values)| {
                values
                    .iter()
                    .map(move |(value, tx)| Fact::assert(*entity, *attribute, value.clone(), *tx))
            })
        })
    }

    /// Ids of entities in a partition
    pub fn entities_in(&self, partition: Partition) -> Vec<EntityId> {
        self.eav
            .keys()
            .filter(|e| e.partition() == partition)
            .copied()
            .collect()
    }

    /// Apply ops atomically; partial work is reverted on error
    pub fn transact(&mut self, ops: &[Op]) -> RippleResult<Novelty> {
        self.basis += 1;
        let tx = self.basis;
        let mut novelty = Novelty::new();

        for op in ops {
            if let Err(e) = self.apply_op(op, tx, &mut novelty) {
                self.revert(&novelty);
                return Err(e);
            }
        }

        Ok(novelty)
    }

    fn apply_op(&mut self, op: &Op, tx: u64, novelty: &mut Novelty) -> RippleResult<()> {
        match op {
            Op::Assert {
                entity,
                attribute,
                value,
            } => {
                let def = self.schema.require_attribute(*attribute)?.clone();
                if value.kind() != def.schema.value_kind {
                    return Err(RippleError::ValueKindMismatch {
                        attribute: def.ident,
                        expected: def.schema.value_kind,
                    });
                }
                if let Value::Ref(target) = value {
                    if entity.is_shared() && !target.partition().is_replicated() {
                        return Err(RippleError::LocalRefLeak {
                            entity: *entity,
                            target: *target,
                        });
                    }
                }
                if self.contains_fact(*entity, *attribute, value) {
                    return Ok(());
                }
                if def.schema.unique {
                    if let Some(owner) = self.lookup_unique(*attribute, value) {
                        if owner != *entity {
                            return Err(RippleError::UniqueConflict {
                                attribute: def.ident,
                                owner,
                            });
                        }
                    }
                }
                if !def.schema.is_many() {
                    for old in self.values(*entity, *attribute) {
                        if let Some(old_tx) = self.remove(*entity, *attribute, &old) {
                            novelty.push(Fact::retract(*entity, *attribute, old, old_tx));
                        }
                    }
                }
                self.insert(*entity, *attribute, value.clone(), tx);
                novelty.push(Fact::assert(*entity, *attribute, value.clone(), tx));
            }
            Op::Retract {
                entity,
                attribute,
                value,
            } => {
                if let Some(old_tx) = self.remove(*entity, *attribute, value) {
                    novelty.push(Fact::retract(*entity, *attribute, value.clone(), old_tx));
                }
            }
        }
        Ok(())
    }

    /// Apply already-derived facts without constraint checks
    ///
    /// Returns the facts that actually changed the store.
    pub fn apply_datoms(&mut self, facts: &[Fact]) -> Novelty {
        self.basis += 1;
        let tx = self.basis;
        let mut novelty = Novelty::new();

        for fact in facts {
            if fact.added {
                if self.insert(fact.entity, fact.attribute, fact.value.clone(), tx) {
                    novelty.push(Fact::assert(fact.entity, fact.attribute, fact.value.clone(), tx));
                }
            } else if let Some(old_tx) = self.remove(fact.entity, fact.attribute, &fact.value) {
                novelty.push(Fact::retract(fact.entity, fact.attribute, fact.value.clone(), old_tx));
            }
        }

        novelty
    }

    /// Undo a novelty produced by this store
    pub fn revert(&mut self, novelty: &Novelty) {
        for fact in novelty.inverse() {
            if fact.added {
                self.insert(fact.entity, fact.attribute, fact.value, fact.tx);
            } else {
                self.remove(fact.entity, fact.attribute, &fact.value);
            }
        }
    }

    pub(crate) fn contains_fact(&self, entity: EntityId, attribute: EntityId, value: &Value) -> bool {
        self.eav
            .get(&entity)
            .and_then(|attrs| attrs.get(&attribute))
            .map_or(false, |values| values.contains_key(value))
    }

    pub(crate) fn values(&self, entity: EntityId, attribute: EntityId) -> Vec<Value> {
        self.eav
            .get(&entity)
            .and_then(|attrs| attrs.get(&attribute))
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn first_value(&self, entity: EntityId, attribute: EntityId) -> Option<&Value> {
        self.eav
            .get(&entity)
            .and_then(|attrs| attrs.get(&attribute))
            .and_then(|values| values.keys().next())
    }

    pub(crate) fn tx_of(&self, entity: EntityId, attribute: EntityId, value: &Value) -> u64 {
        self.eav
            .get(&entity)
            .and_then(|attrs| attrs.get(&attribute))
            .and_then(|values| values.get(value))
            .copied()
            .unwrap_or(0)
    }

    fn insert(&mut self, entity: EntityId, attribute: EntityId, value: Value, tx: u64) -> bool {
        let values = self.eav.entry(entity).or_default().entry(attribute).or_default();
        if values.contains_key(&value) {
            return false;
        }
        values.insert(value.clone(), tx);

        if let Value::Ref(target) = value {
            self.vae.entry(target).or_default().insert((entity, attribute));
        }
        self.ave
            .entry(attribute)
            .or_default()
            .entry(value)
            .or_default()
            .insert(entity);
        true
    }

    fn remove(&mut self, entity: EntityId, attribute: EntityId, value: &Value) -> Option<u64> {
        let attrs = self.eav.get_mut(&entity)?;
        let values = attrs.get_mut(&attribute)?;
        let tx = values.remove(value)?;
        if values.is_empty() {
            attrs.remove(&attribute);
        }
        if attrs.is_empty() {
            self.eav.remove(&entity);
        }

        if let Some(by_value) = self.ave.get_mut(&attribute) {
            if let Some(entities) = by_value.get_mut(value) {
                entities.remove(&entity);
                if entities.is_empty() {
                    by_value.remove(value);
                }
            }
            if by_value.is_empty() {
                self.ave.remove(&attribute);
            }
        }

        if let Value::Ref(target) = value {
            if let Some(refs) = self.vae.get_mut(target) {
                refs.remove(&(entity, attribute));
                if refs.is_empty() {
                    self.vae.remove(target);
                }
            }
        }

        Some(tx)
    }
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}
