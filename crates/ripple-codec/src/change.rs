//! Recording write context
//!
//! A `Change` wraps a store for the duration of one local transaction.
//! Reads go through it so they can be traced; writes are applied at once
//! and recorded together with their wire form. Reads issued since the
//! previous shared write are folded into a `Validate` placed right after
//! the next write that reaches the wire.

use rand::random;
use tracing::trace;

use ripple_core::{AttributeSchema, EntityId, Fact, Novelty, Partition, RippleResult, Uid, Value};
use ripple_store::{Db, IndexQuery};
use ripple_wire::WireInstruction;

use crate::{Instruction, InstructionSet, ReadTrace};

/// Side effect run after the change becomes visible
pub type DeferredEffect = Box<dyn FnOnce() -> RippleResult<()> + Send>;

/// One recorded instruction with its wire form and effect
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedInstruction {
    pub instruction: Instruction,
    /// `None` when the instruction has no shared effect
    pub wire: Option<WireInstruction>,
    pub novelty: Novelty,
}

/// Everything a finished change recorded
#[derive(Default)]
pub struct ChangeOutcome {
    pub applied: Vec<AppliedInstruction>,
    pub deferred: Vec<DeferredEffect>,
}

impl ChangeOutcome {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Combined effect, in application order
    pub fn novelty(&self) -> Novelty {
        let mut novelty = Novelty::new();
        for applied in &self.applied {
            novelty.extend(applied.novelty.clone());
        }
        novelty
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.applied.iter().map(|a| a.instruction.clone()).collect()
    }

    /// Wire instructions, validations included
    ///
    /// Empty when nothing but validations would be sent.
    pub fn wire(&self) -> Vec<WireInstruction> {
        let wire: Vec<WireInstruction> = self.applied.iter().filter_map(|a| a.wire.clone()).collect();
        if wire.iter().all(WireInstruction::is_validate) {
            Vec::new()
        } else {
            wire
        }
    }

    /// Wire instructions that changed Shared facts, validations stripped
    pub fn shared_wire(&self) -> Vec<WireInstruction> {
        self.applied
            .iter()
            .filter(|a| a.novelty.touches_shared())
            .filter_map(|a| a.wire.as_ref().and_then(WireInstruction::without_validations))
            .collect()
    }
}

impl std::fmt::Debug for ChangeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeOutcome")
            .field("applied", &self.applied)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

/// Recording write context over a store
pub struct Change<'a> {
    db: &'a mut Db,
    set: &'a InstructionSet,
    trace: ReadTrace,
    applied: Vec<AppliedInstruction>,
    deferred: Vec<DeferredEffect>,
}

impl<'a> Change<'a> {
    pub fn new(db: &'a mut Db, set: &'a InstructionSet) -> Self {
        Change {
            db,
            set,
            trace: ReadTrace::new(),
            applied: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Untraced view of the store
    pub fn db(&self) -> &Db {
        self.db
    }

    // Traced reads

    /// Run an index query and record it
    ///
    /// # Panics
    ///
    /// On `IndexQuery::All`.
    pub fn query(&mut self, query: &IndexQuery) -> Vec<Fact> {
        let results = self.db.query(query);
        self.trace.record(self.db, query, &results);
        results
    }

    pub fn get_one(&mut self, entity: EntityId, attribute: EntityId) -> Option<Value> {
        self.query(&IndexQuery::GetOne { entity, attribute })
            .into_iter()
            .next()
            .map(|f| f.value)
    }

    pub fn get_many(&mut self, entity: EntityId, attribute: EntityId) -> Vec<Value> {
        self.query(&IndexQuery::GetMany { entity, attribute })
            .into_iter()
            .map(|f| f.value)
            .collect()
    }

    pub fn contains(&mut self, entity: EntityId, attribute: EntityId, value: impl Into<Value>) -> bool {
        !self
            .query(&IndexQuery::Contains {
                entity,
                attribute,
                value: value.into(),
            })
            .is_empty()
    }

    pub fn entity(&mut self, entity: EntityId) -> Vec<Fact> {
        self.query(&IndexQuery::Entity { entity })
    }

    pub fn column(&mut self, attribute: EntityId) -> Vec<Fact> {
        self.query(&IndexQuery::Column { attribute })
    }

    pub fn lookup_unique(&mut self, attribute: EntityId, value: impl Into<Value>) -> Option<EntityId> {
        self.query(&IndexQuery::LookupUnique {
            attribute,
            value: value.into(),
        })
        .into_iter()
        .next()
        .map(|f| f.entity)
    }

    pub fn lookup_many(&mut self, attribute: EntityId, value: impl Into<Value>) -> Vec<EntityId> {
        self.query(&IndexQuery::LookupMany {
            attribute,
            value: value.into(),
        })
        .into_iter()
        .map(|f| f.entity)
        .collect()
    }

    /// (referencer, attribute) pairs pointing at `target`
    pub fn refs_to(&mut self, target: EntityId) -> Vec<(EntityId, EntityId)> {
        self.query(&IndexQuery::RefsTo { target })
            .into_iter()
            .map(|f| (f.entity, f.attribute))
            .collect()
    }

    // Schema

    /// Define or look up an attribute
    pub fn attribute(&mut self, ident: &str, schema: AttributeSchema) -> RippleResult<EntityId> {
        self.db.ensure_attribute(ident, schema)
    }

    /// Define or look up an entity type
    pub fn entity_type(&mut self, ident: &str) -> RippleResult<EntityId> {
        self.db.ensure_entity_type(ident)
    }

    // Writes

    /// Create an entity; replicated entities get a fresh uid
    pub fn create_entity(
        &mut self,
        partition: Partition,
        entity_type: &str,
        attributes: Vec<(EntityId, Value)>,
    ) -> RippleResult<EntityId> {
        let entity_type = self.db.ensure_entity_type(entity_type)?;
        let entity = self.db.allocate(partition);
        let uid = partition.is_replicated().then(Uid::generate);
        self.write(Instruction::CreateEntity {
            seed: random(),
            entity,
            entity_type,
            uid,
            attributes,
        })?;
        Ok(entity)
    }

    pub fn add(&mut self, entity: EntityId, attribute: EntityId, value: impl Into<Value>) -> RippleResult<Novelty> {
        self.write(Instruction::Add {
            seed: random(),
            entity,
            attribute,
            value: value.into(),
        })
    }

    pub fn remove(&mut self, entity: EntityId, attribute: EntityId, value: impl Into<Value>) -> RippleResult<Novelty> {
        self.write(Instruction::Remove {
            seed: random(),
            entity,
            attribute,
            value: value.into(),
        })
    }

    pub fn retract_attribute(&mut self, entity: EntityId, attribute: EntityId) -> RippleResult<Novelty> {
        self.write(Instruction::RetractAttribute {
            seed: random(),
            entity,
            attribute,
        })
    }

    /// Retract an entity together with its cascade set
    pub fn retract_entity(&mut self, entity: EntityId) -> RippleResult<Novelty> {
        self.write(Instruction::RetractEntity {
            seed: random(),
            entity,
        })
    }

    /// Group the writes made by `f` into one atomic composite
    ///
    /// If `f` fails, its writes are undone and the error returned.
    pub fn atomic<T>(&mut self, f: impl FnOnce(&mut Self) -> RippleResult<T>) -> RippleResult<T> {
        let mark = self.applied.len();
        let result = f(self);
        let children: Vec<AppliedInstruction> = self.applied.drain(mark..).collect();

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                for child in children.iter().rev() {
                    self.db.revert(&child.novelty);
                }
                return Err(e);
            }
        };
        if children.is_empty() {
            return Ok(value);
        }

        let seed = random();
        let mut novelty = Novelty::new();
        let mut instructions = Vec::with_capacity(children.len());
        let mut wires = Vec::new();
        for child in children {
            novelty.extend(child.novelty);
            instructions.push(child.instruction);
            wires.extend(child.wire);
        }
        let wire = if wires.iter().all(WireInstruction::is_validate) {
            None
        } else {
            Some(WireInstruction::AtomicComposite {
                seed,
                instructions: wires,
            })
        };

        self.applied.push(AppliedInstruction {
            instruction: Instruction::AtomicComposite { seed, instructions },
            wire,
            novelty,
        });
        Ok(value)
    }

    /// Run `effect` once the change is visible
    pub fn defer(&mut self, effect: impl FnOnce() -> RippleResult<()> + Send + 'static) {
        self.deferred.push(Box::new(effect));
    }

    /// Undo every write recorded so far
    pub fn rollback(&mut self) {
        for applied in self.applied.drain(..).rev() {
            self.db.revert(&applied.novelty);
        }
        self.deferred.clear();
        self.trace = ReadTrace::new();
    }

    pub fn finish(self) -> ChangeOutcome {
        ChangeOutcome {
            applied: self.applied,
            deferred: self.deferred,
        }
    }

    fn write(&mut self, instruction: Instruction) -> RippleResult<Novelty> {
        // encode first: a retracted entity loses the uid it is addressed by
        let wire = self.set.encode(self.db, &instruction)?;
        let novelty = self.set.apply(self.db, &instruction)?;
        trace!("applied {:?} ({} facts)", instruction.tag(), novelty.len());

        let seed = instruction.seed();
        let shared = wire.is_some();
        self.applied.push(AppliedInstruction {
            instruction,
            wire,
            novelty: novelty.clone(),
        });

        // reads behind a local-only write stay pending for the next shared one
        if shared && !self.trace.is_empty() {
            let (queries, hash) = self.trace.finalize(seed);
            self.applied.push(AppliedInstruction {
                instruction: Instruction::Validate {
                    seed,
                    queries: queries.clone(),
                    hash,
                },
                wire: Some(WireInstruction::Validate { seed, queries, hash }),
                novelty: Novelty::new(),
            });
        }
        Ok(novelty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_snapshot;
    use ripple_core::RippleError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn setup() -> (Db, InstructionSet) {
        (Db::new(), InstructionSet::standard())
    }

    #[test]
    fn test_shared_entity_gets_uid_local_does_not() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let name = change.attribute("todo/name", AttributeSchema::scalar()).unwrap();
        let shared = change
            .create_entity(Partition::Shared, "todo", vec![(name, "a".into())])
            .unwrap();
        let local = change
            .create_entity(Partition::Local, "draft", vec![(name, "b".into())])
            .unwrap();
        let outcome = change.finish();

        assert!(db.uid_of(shared).is_some());
        assert!(db.uid_of(local).is_none());
        assert_eq!(outcome.applied.len(), 2);
        assert!(outcome.applied[0].wire.is_some());
        assert!(outcome.applied[1].wire.is_none());
        assert_eq!(outcome.shared_wire().len(), 1);
    }

    #[test]
    fn test_reads_become_validate_after_write() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let count = change.attribute("counter/value", AttributeSchema::scalar()).unwrap();
        let e = change
            .create_entity(Partition::Shared, "counter", vec![(count, Value::Int(1))])
            .unwrap();

        let current = change.get_one(e, count).and_then(|v| v.as_int()).unwrap();
        change.add(e, count, current + 1).unwrap();
        let outcome = change.finish();

        let wire = outcome.wire();
        assert_eq!(wire.len(), 3);
        assert!(matches!(wire[1], WireInstruction::Add { .. }));
        match &wire[2] {
            WireInstruction::Validate { seed, queries, .. } => {
                assert_eq!(*seed, wire[1].seed());
                assert_eq!(queries.len(), 1);
            }
            other => panic!("expected validate, got {:?}", other),
        }
        // validations never reach other clients
        assert_eq!(outcome.shared_wire().len(), 2);
    }

    #[test]
    fn test_trailing_reads_are_not_recorded() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let count = change.attribute("counter/value", AttributeSchema::scalar()).unwrap();
        let e = change
            .create_entity(Partition::Shared, "counter", vec![(count, Value::Int(1))])
            .unwrap();
        change.get_one(e, count);
        let outcome = change.finish();

        assert_eq!(outcome.applied.len(), 1);
    }

    #[test]
    fn test_local_reads_add_no_validate() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let name = change.attribute("todo/name", AttributeSchema::scalar()).unwrap();
        let draft = change
            .create_entity(Partition::Local, "draft", vec![(name, "x".into())])
            .unwrap();
        let shared = change.create_entity(Partition::Shared, "todo", vec![]).unwrap();

        let text = change.get_one(draft, name).unwrap();
        change.add(shared, name, text).unwrap();
        let outcome = change.finish();

        assert!(outcome.applied.iter().all(|a| !a.instruction.is_validate()));
    }

    #[test]
    fn test_reads_behind_local_write_do_not_guard_earlier_write() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let name = change.attribute("todo/name", AttributeSchema::scalar()).unwrap();
        let e = change
            .create_entity(Partition::Shared, "todo", vec![(name, "a".into())])
            .unwrap();
        change.finish();
        let base = db.clone();

        let mut change = Change::new(&mut db, &set);
        change.add(e, name, "b").unwrap();
        let current = change.get_one(e, name).unwrap();
        change
            .create_entity(Partition::Local, "draft", vec![(name, current)])
            .unwrap();
        let outcome = change.finish();

        let wire = outcome.wire();
        assert_eq!(wire.len(), 1);
        assert!(matches!(wire[0], WireInstruction::Add { .. }));

        let mut canonical = base;
        set.transact_wire(&mut canonical, &wire).unwrap();
        assert_eq!(canonical.get_one(e, name), Some(Value::from("b")));
    }

    #[test]
    fn test_reads_carried_past_local_write_to_next_shared_write() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let name = change.attribute("todo/name", AttributeSchema::scalar()).unwrap();
        let title = change.attribute("todo/title", AttributeSchema::scalar()).unwrap();
        let summary = change.attribute("todo/summary", AttributeSchema::scalar()).unwrap();
        let e = change
            .create_entity(Partition::Shared, "todo", vec![(name, "a".into()), (title, "t".into())])
            .unwrap();
        change.finish();
        let base = db.clone();

        let mut change = Change::new(&mut db, &set);
        change.add(e, name, "b").unwrap();
        let current = change.get_one(e, title).unwrap();
        change
            .create_entity(Partition::Local, "draft", vec![(title, current.clone())])
            .unwrap();
        change.add(e, summary, current).unwrap();
        let outcome = change.finish();

        let wire = outcome.wire();
        assert_eq!(wire.len(), 3);
        assert!(matches!(wire[1], WireInstruction::Add { .. }));
        assert!(wire[2].is_validate());
        assert_eq!(wire[2].seed(), wire[1].seed());

        let mut canonical = base.clone();
        set.transact_wire(&mut canonical, &wire).unwrap();
        assert_eq!(canonical.get_one(e, summary), Some(Value::from("t")));

        // a concurrent retitle invalidates the derived summary
        let mut moved = base;
        let mut other = Change::new(&mut moved, &set);
        other.add(e, title, "u").unwrap();
        other.finish();
        assert!(matches!(
            set.transact_wire(&mut moved, &wire),
            Err(RippleError::AssumptionsViolated { .. })
        ));
    }

    #[test]
    fn test_local_ref_leak_rejected_before_commit() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let owner = change.attribute("todo/owner", AttributeSchema::reference()).unwrap();
        let shared = change.create_entity(Partition::Shared, "todo", vec![]).unwrap();
        let local = change.create_entity(Partition::Local, "draft", vec![]).unwrap();

        assert!(matches!(
            change.add(shared, owner, local),
            Err(RippleError::LocalRefLeak { .. })
        ));
        change.finish();
        assert_eq!(db.get_one(shared, owner), None);
    }

    #[test]
    fn test_atomic_groups_and_reverts() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let name = change.attribute("todo/name", AttributeSchema::scalar()).unwrap();

        let created = change
            .atomic(|c| {
                let a = c.create_entity(Partition::Shared, "todo", vec![(name, "a".into())])?;
                let b = c.create_entity(Partition::Shared, "todo", vec![(name, "b".into())])?;
                Ok((a, b))
            })
            .unwrap();

        let failed: RippleResult<()> = change.atomic(|c| {
            c.create_entity(Partition::Shared, "todo", vec![(name, "c".into())])?;
            Err(RippleError::Hook("abort".into()))
        });
        assert!(failed.is_err());
        let outcome = change.finish();

        assert_eq!(outcome.applied.len(), 1);
        match &outcome.applied[0].wire {
            Some(WireInstruction::AtomicComposite { instructions, .. }) => assert_eq!(instructions.len(), 2),
            other => panic!("expected composite, got {:?}", other),
        }
        assert!(db.exists(created.0) && db.exists(created.1));
        assert_eq!(db.entities_in(Partition::Shared).len(), 2);
    }

    #[test]
    fn test_rollback_restores_store() {
        let (mut db, set) = setup();
        let name = db.ensure_attribute("todo/name", AttributeSchema::scalar()).unwrap();
        let before = shared_snapshot(&db).unwrap();

        let mut change = Change::new(&mut db, &set);
        let e = change
            .create_entity(Partition::Shared, "todo", vec![(name, "a".into())])
            .unwrap();
        change.add(e, name, "b").unwrap();
        change.rollback();
        let outcome = change.finish();

        assert!(outcome.is_empty());
        assert_eq!(shared_snapshot(&db).unwrap(), before);
    }

    #[test]
    fn test_retract_entity_encodes_before_uid_disappears() {
        let (mut db, set) = setup();
        let mut change = Change::new(&mut db, &set);
        let e = change.create_entity(Partition::Shared, "todo", vec![]).unwrap();
        let uid = change.db().uid_of(e).unwrap();
        change.retract_entity(e).unwrap();
        let outcome = change.finish();

        assert_eq!(
            outcome.applied[1].wire,
            Some(WireInstruction::RetractEntity {
                seed: outcome.applied[1].instruction.seed(),
                entity: uid,
            })
        );
        assert!(!db.exists(e));
    }

    #[test]
    fn test_deferred_effects_carried_out() {
        let (mut db, set) = setup();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut change = Change::new(&mut db, &set);
        let counter = ran.clone();
        change.defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let outcome = change.finish();

        for effect in outcome.deferred {
            effect().unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
