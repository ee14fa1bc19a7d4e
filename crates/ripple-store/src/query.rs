//! Index queries and reference following
//!
//! Eight bounded query shapes can be traced and replayed. `All` is the
//! unbounded scan and exists only for tooling.

use std::collections::{BTreeSet, VecDeque};

use ripple_core::{EntityId, Fact, Value};

use crate::{Db, Op};

/// Index query shape
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexQuery {
    /// Every fact with an attribute
    Column { attribute: EntityId },
    /// The fact (entity, attribute, value), if present
    Contains {
        entity: EntityId,
        attribute: EntityId,
        value: Value,
    },
    /// Every fact of an entity
    Entity { entity: EntityId },
    /// The single value of a card-one attribute
    GetOne { entity: EntityId, attribute: EntityId },
    /// All values of an attribute on an entity
    GetMany { entity: EntityId, attribute: EntityId },
    /// Entities holding a value
    LookupMany { attribute: EntityId, value: Value },
    /// The entity holding a unique value
    LookupUnique { attribute: EntityId, value: Value },
    /// Facts referencing an entity
    RefsTo { target: EntityId },
    /// Unbounded scan
    All,
}

impl IndexQuery {
    /// Can this query be recorded and replayed?
    pub fn is_traceable(&self) -> bool {
        !matches!(self, IndexQuery::All)
    }
}

impl Db {
    /// Execute an index query; results are in index order
    pub fn query(&self, query: &IndexQuery) -> Vec<Fact> {
        match query {
            IndexQuery::Column { attribute } => self
                .ave
                .get(attribute)
                .map(|by_value| {
                    by_value
                        .iter()
                        .flat_map(|(value, entities)| {
                            entities.iter().map(move |e| {
                                Fact::assert(*e, *attribute, value.clone(), self.tx_of(*e, *attribute, value))
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            IndexQuery::Contains {
                entity,
                attribute,
                value,
            } => {
                if self.contains_fact(*entity, *attribute, value) {
                    vec![Fact::assert(
                        *entity,
                        *attribute,
                        value.clone(),
                        self.tx_of(*entity, *attribute, value),
                    )]
                } else {
                    Vec::new()
                }
            }
            IndexQuery::Entity { entity } => self.facts_of(*entity),
            IndexQuery::GetOne { entity, attribute } => self
                .first_value(*entity, *attribute)
                .map(|v| vec![Fact::assert(*entity, *attribute, v.clone(), self.tx_of(*entity, *attribute, v))])
                .unwrap_or_default(),
            IndexQuery::GetMany { entity, attribute } => self
                .values(*entity, *attribute)
                .into_iter()
                .map(|v| {
                    let tx = self.tx_of(*entity, *attribute, &v);
                    Fact::assert(*entity, *attribute, v, tx)
                })
                .collect(),
            IndexQuery::LookupMany { attribute, value } => self
                .lookup_many(*attribute, value)
                .into_iter()
                .map(|e| Fact::assert(e, *attribute, value.clone(), self.tx_of(e, *attribute, value)))
                .collect(),
            IndexQuery::LookupUnique { attribute, value } => self
                .lookup_unique(*attribute, value)
                .map(|e| vec![Fact::assert(e, *attribute, value.clone(), self.tx_of(e, *attribute, value))])
                .unwrap_or_default(),
            IndexQuery::RefsTo { target } => self
                .refs_to(*target)
                .into_iter()
                .map(|(e, a)| {
                    let value = Value::Ref(*target);
                    let tx = self.tx_of(e, a, &value);
                    Fact::assert(e, a, value, tx)
                })
                .collect(),
            IndexQuery::All => self.datoms().collect(),
        }
    }

    pub fn get_one(&self, entity: EntityId, attribute: EntityId) -> Option<Value> {
        self.first_value(entity, attribute).cloned()
    }

    pub fn get_many(&self, entity: EntityId, attribute: EntityId) -> Vec<Value> {
        self.values(entity, attribute)
    }

    pub fn contains(&self, entity: EntityId, attribute: EntityId, value: &Value) -> bool {
        self.contains_fact(entity, attribute, value)
    }

    /// Entity holding a value; for unique attributes there is at most one
    pub fn lookup_unique(&self, attribute: EntityId, value: &Value) -> Option<EntityId> {
        self.ave
            .get(&attribute)
            .and_then(|by_value| by_value.get(value))
            .and_then(|entities| entities.iter().next().copied())
    }

    pub fn lookup_many(&self, attribute: EntityId, value: &Value) -> Vec<EntityId> {
        self.ave
            .get(&attribute)
            .and_then(|by_value| by_value.get(value))
            .map(|entities| entities.iter().copied().collect())
            .unwrap_or_default()
    }

    /// (referencer, attribute) pairs pointing at `target`
    pub fn refs_to(&self, target: EntityId) -> Vec<(EntityId, EntityId)> {
        self.vae
            .get(&target)
            .map(|refs| refs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Entities that disappear together with `entity`, starting with it
    ///
    /// A referencer through a `required` attribute dies with its target;
    /// the target of a `cascade_delete` attribute dies with its referencer.
    pub fn cascade_set(&self, entity: EntityId) -> Vec<EntityId> {
        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([entity]);

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            order.push(next);

            for (referencer, attribute) in self.refs_to(next) {
                let required = self
                    .schema
                    .attribute(attribute)
                    .map_or(false, |def| def.schema.required);
                if required && !seen.contains(&referencer) {
                    queue.push_back(referencer);
                }
            }

            if let Some(attrs) = self.eav.get(&next) {
                for (attribute, values) in attrs {
                    let cascades = self
                        .schema
                        .attribute(*attribute)
                        .map_or(false, |def| def.schema.cascade_delete);
                    if !cascades {
                        continue;
                    }
                    for value in values.keys() {
                        if let Value::Ref(target) = value {
                            if !seen.contains(target) {
                                queue.push_back(*target);
                            }
                        }
                    }
                }
            }
        }

        order
    }

    /// Ops retracting the cascade set of `entity` and every reference into it
    pub fn retract_entity_ops(&self, entity: EntityId) -> Vec<Op> {
        let doomed = self.cascade_set(entity);
        let members: BTreeSet<EntityId> = doomed.iter().copied().collect();
        let mut ops = Vec::new();

        for e in &doomed {
            for (referencer, attribute) in self.refs_to(*e) {
                if !members.contains(&referencer) {
                    ops.push(Op::retract(referencer, attribute, Value::Ref(*e)));
                }
            }
            for fact in self.facts_of(*e) {
                ops.push(Op::retract(fact.entity, fact.attribute, fact.value));
            }
        }

        ops
    }
}
