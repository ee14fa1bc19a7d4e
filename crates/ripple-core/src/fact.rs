//! Facts and novelty
//!
//! A fact is the minimal causal record kept by the store. Novelty is the
//! ordered list of facts one apply actually changed; it can be inverted to
//! unwind that apply.

use std::collections::BTreeSet;

use crate::{EntityId, Value};

/// Fact - (entity, attribute, value, transaction, added/retracted)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fact {
    pub entity: EntityId,
    pub attribute: EntityId,
    pub value: Value,
    /// Store basis of the assertion this fact adds or retracts
    pub tx: u64,
    pub added: bool,
}

impl Fact {
    pub fn assert(entity: EntityId, attribute: EntityId, value: Value, tx: u64) -> Self {
        Fact {
            entity,
            attribute,
            value,
            tx,
            added: true,
        }
    }

    pub fn retract(entity: EntityId, attribute: EntityId, value: Value, tx: u64) -> Self {
        Fact {
            entity,
            attribute,
            value,
            tx,
            added: false,
        }
    }

    /// The fact that undoes this one
    pub fn inverse(&self) -> Fact {
        Fact {
            added: !self.added,
            ..self.clone()
        }
    }
}

/// Novelty - facts changed by one apply, in application order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Novelty {
    facts: Vec<Fact>,
}

impl Novelty {
    pub fn new() -> Self {
        Novelty::default()
    }

    pub fn push(&mut self, fact: Fact) {
        self.facts.push(fact);
    }

    pub fn extend(&mut self, other: Novelty) {
        self.facts.extend(other.facts);
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter()
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn into_facts(self) -> Vec<Fact> {
        self.facts
    }

    /// Novelty that unwinds this one: reversed order, flipped polarity
    pub fn inverse(&self) -> Novelty {
        Novelty {
            facts: self.facts.iter().rev().map(Fact::inverse).collect(),
        }
    }

    /// (entity, attribute) pairs touched
    pub fn touched(&self) -> BTreeSet<(EntityId, EntityId)> {
        self.facts.iter().map(|f| (f.entity, f.attribute)).collect()
    }

    /// Does any fact concern a Shared entity?
    pub fn touches_shared(&self) -> bool {
        self.facts.iter().any(|f| f.entity.is_shared())
    }
}

impl From<Vec<Fact>> for Novelty {
    fn from(facts: Vec<Fact>) -> Self {
        Novelty { facts }
    }
}

impl IntoIterator for Novelty {
    type Item = Fact;
    type IntoIter = std::vec::IntoIter<Fact>;

    fn into_iter(self) -> Self::IntoIter {
        self.facts.into_iter()
    }
}

impl<'a> IntoIterator for &'a Novelty {
    type Item = &'a Fact;
    type IntoIter = std::slice::Iter<'a, Fact>;

    fn into_iter(self) -> Self::IntoIter {
        self.facts.iter()
    }
}
