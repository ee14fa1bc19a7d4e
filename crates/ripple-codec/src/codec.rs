//! Instruction codec table
//!
//! Each instruction kind registers plain functions for encode, decode and
//! expand. The set is built once and shared; dispatch is on the tag.
//!
//! - encode: local → wire, `None` when the instruction has no shared effect
//! - decode: wire → local, defining unknown schema on read
//! - expand: local → primitive store ops against the current state

use std::fmt;

use ripple_core::{EntityId, Novelty, RippleError, RippleResult, Uid, Value};
use ripple_store::{Db, Op, ENTITY_TYPE, ENTITY_UID};
use ripple_wire::{DurableValue, WireInstruction};

use crate::{durable_attribute, durable_value, verify, Instruction, InstructionTag, Resolver};

pub type EncodeFn = fn(&InstructionSet, &Db, &Instruction) -> RippleResult<Option<WireInstruction>>;
pub type DecodeFn = fn(&InstructionSet, &mut Decoder<'_>, &WireInstruction) -> RippleResult<Vec<Instruction>>;
pub type ExpandFn = fn(&InstructionSet, &Db, &Instruction) -> RippleResult<Vec<Op>>;

/// Codec functions for one instruction kind
#[derive(Clone, Copy)]
pub struct InstructionCodec {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
    pub expand: ExpandFn,
}

/// Decode context: the target store and the uids allocated so far
pub struct Decoder<'a> {
    pub db: &'a mut Db,
    pub resolver: Resolver,
}

impl<'a> Decoder<'a> {
    pub fn new(db: &'a mut Db) -> Self {
        Decoder {
            db,
            resolver: Resolver::new(),
        }
    }
}

/// Registered codecs, indexed by tag
#[derive(Clone)]
pub struct InstructionSet {
    codecs: [Option<InstructionCodec>; 7],
}

impl InstructionSet {
    /// Set with nothing registered
    pub fn empty() -> Self {
        InstructionSet { codecs: [None; 7] }
    }

    /// Set with every built-in instruction kind
    pub fn standard() -> Self {
        let mut set = InstructionSet::empty();
        set.register(
            InstructionTag::CreateEntity,
            InstructionCodec {
                encode: encode_create_entity,
                decode: decode_create_entity,
                expand: expand_create_entity,
            },
        );
        set.register(
            InstructionTag::Add,
            InstructionCodec {
                encode: encode_add,
                decode: decode_add,
                expand: expand_add,
            },
        );
        set.register(
            InstructionTag::Remove,
            InstructionCodec {
                encode: encode_remove,
                decode: decode_remove,
                expand: expand_remove,
            },
        );
        set.register(
            InstructionTag::RetractAttribute,
            InstructionCodec {
                encode: encode_retract_attribute,
                decode: decode_retract_attribute,
                expand: expand_retract_attribute,
            },
        );
        set.register(
            InstructionTag::RetractEntity,
            InstructionCodec {
                encode: encode_retract_entity,
                decode: decode_retract_entity,
                expand: expand_retract_entity,
            },
        );
        set.register(
            InstructionTag::AtomicComposite,
            InstructionCodec {
                encode: encode_composite,
                decode: decode_composite,
                expand: expand_composite,
            },
        );
        set.register(
            InstructionTag::Validate,
            InstructionCodec {
                encode: encode_validate,
                decode: decode_validate,
                expand: expand_validate,
            },
        );
        set
    }

    pub fn register(&mut self, tag: InstructionTag, codec: InstructionCodec) {
        self.codecs[tag.index()] = Some(codec);
    }

    pub fn codec(&self, tag: InstructionTag) -> RippleResult<InstructionCodec> {
        self.codecs[tag.index()]
            .ok_or_else(|| RippleError::InvalidWireFormat(format!("No codec registered for {:?}", tag)))
    }

    /// Wire form of an instruction; `None` when it has no shared effect
    pub fn encode(&self, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
        (self.codec(instruction.tag())?.encode)(self, db, instruction)
    }

    /// Local instructions for a wire instruction
    pub fn decode(&self, db: &mut Db, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
        let mut decoder = Decoder::new(db);
        self.decode_with(&mut decoder, wire)
    }

    pub fn decode_with(&self, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
        (self.codec(InstructionTag::of_wire(wire))?.decode)(self, decoder, wire)
    }

    /// Primitive ops an instruction stands for in the current state
    pub fn expand(&self, db: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
        (self.codec(instruction.tag())?.expand)(self, db, instruction)
    }

    /// Apply one instruction; composites apply their children in order,
    /// all or nothing
    pub fn apply(&self, db: &mut Db, instruction: &Instruction) -> RippleResult<Novelty> {
        match instruction {
            Instruction::AtomicComposite { instructions, .. } => self.apply_all(db, instructions),
            other => {
                let ops = self.expand(db, other)?;
                db.transact(&ops)
            }
        }
    }

    /// Apply instructions in order, all or nothing
    pub fn apply_all(&self, db: &mut Db, instructions: &[Instruction]) -> RippleResult<Novelty> {
        let mut novelty = Novelty::new();
        for instruction in instructions {
            match self.apply(db, instruction) {
                Ok(n) => novelty.extend(n),
                Err(e) => {
                    db.revert(&novelty);
                    return Err(e);
                }
            }
        }
        Ok(novelty)
    }

    /// Decode and apply wire instructions, all or nothing
    ///
    /// A `Validate` guards the instruction in front of it: its reads were
    /// taken before that instruction ran, so it is checked first.
    pub fn transact_wire(&self, db: &mut Db, wires: &[WireInstruction]) -> RippleResult<Novelty> {
        let mut novelty = Novelty::new();
        match self.transact_wire_into(db, wires, &mut novelty) {
            Ok(()) => Ok(novelty),
            Err(e) => {
                db.revert(&novelty);
                Err(e)
            }
        }
    }

    fn transact_wire_into(
        &self,
        db: &mut Db,
        wires: &[WireInstruction],
        novelty: &mut Novelty,
    ) -> RippleResult<()> {
        let mut i = 0;
        while i < wires.len() {
            let current = &wires[i];
            let mut step = 1;
            if !current.is_validate() {
                if let Some(guard @ WireInstruction::Validate { .. }) = wires.get(i + 1) {
                    self.decode(db, guard)?;
                    step = 2;
                }
            }

            match current {
                WireInstruction::AtomicComposite { instructions, .. } => {
                    self.transact_wire_into(db, instructions, novelty)?;
                }
                _ => {
                    for instruction in self.decode(db, current)? {
                        novelty.extend(self.apply(db, &instruction)?);
                    }
                }
            }
            i += step;
        }
        Ok(())
    }
}

impl Default for InstructionSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<InstructionTag> = InstructionTag::ALL
            .iter()
            .copied()
            .filter(|tag| self.codecs[tag.index()].is_some())
            .collect();
        f.debug_struct("InstructionSet")
            .field("registered", &registered)
            .finish()
    }
}

fn mismatch(expected: InstructionTag) -> RippleError {
    RippleError::ProtocolViolation(format!("{:?} codec dispatched with another kind", expected))
}

/// Uid of an entity whose writes replicate
fn replicated_uid(db: &Db, entity: EntityId) -> Option<Uid> {
    if entity.partition().is_replicated() {
        db.uid_of(entity)
    } else {
        None
    }
}

/// Durable value written on a replicated entity
fn shared_value(db: &Db, entity: EntityId, value: &Value) -> RippleResult<DurableValue> {
    if let Value::Ref(target) = value {
        if !target.partition().is_replicated() {
            return Err(RippleError::LocalRefLeak {
                entity,
                target: *target,
            });
        }
    }
    durable_value(db, value)
}

fn unknown_entity(uid: Uid) -> RippleError {
    RippleError::UnknownEntity(uid.to_string())
}

// CreateEntity

fn encode_create_entity(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::CreateEntity {
        seed,
        entity,
        entity_type,
        uid,
        attributes,
    } = instruction
    else {
        return Err(mismatch(InstructionTag::CreateEntity));
    };
    let uid = match uid {
        Some(uid) if entity.partition().is_replicated() => *uid,
        _ => return Ok(None),
    };
    if !db.schema().is_entity_type(*entity_type) {
        return Err(RippleError::UnknownEntityType(format!("{:?}", entity_type)));
    }
    let entity_type = db
        .schema()
        .ident_of(*entity_type)
        .ok_or_else(|| RippleError::UnknownEntityType(format!("{:?}", entity_type)))?
        .to_string();

    let mut durable = Vec::with_capacity(attributes.len());
    for (attribute, value) in attributes {
        durable.push((durable_attribute(db, *attribute)?, shared_value(db, *entity, value)?));
    }

    Ok(Some(WireInstruction::CreateEntity {
        seed: *seed,
        uid,
        entity_type,
        attributes: durable,
    }))
}

fn decode_create_entity(_: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::CreateEntity {
        seed,
        uid,
        entity_type,
        attributes,
    } = wire
    else {
        return Err(mismatch(InstructionTag::CreateEntity));
    };
    let entity_type = decoder.db.ensure_entity_type(entity_type)?;

    let mut local = Vec::with_capacity(attributes.len());
    for (attribute, value) in attributes {
        let attribute = decoder.resolver.attribute(decoder.db, attribute)?;
        let value = match decoder.resolver.value(decoder.db, value)? {
            Some(value) => value,
            None => return Err(RippleError::UnknownEntity(format!("{:?}", value))),
        };
        local.push((attribute, value));
    }
    let entity = decoder.resolver.entity_or_create(decoder.db, *uid);

    Ok(vec![Instruction::CreateEntity {
        seed: *seed,
        entity,
        entity_type,
        uid: Some(*uid),
        attributes: local,
    }])
}

fn expand_create_entity(_: &InstructionSet, _: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
    let Instruction::CreateEntity {
        entity,
        entity_type,
        uid,
        attributes,
        ..
    } = instruction
    else {
        return Err(mismatch(InstructionTag::CreateEntity));
    };

    let mut ops = Vec::with_capacity(attributes.len() + 2);
    if let Some(uid) = uid {
        ops.push(Op::assert(*entity, ENTITY_UID, uid.to_string()));
    }
    ops.push(Op::assert(*entity, ENTITY_TYPE, Value::Ref(*entity_type)));
    for (attribute, value) in attributes {
        ops.push(Op::assert(*entity, *attribute, value.clone()));
    }
    Ok(ops)
}

// Add / Remove

fn encode_add(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::Add {
        seed,
        entity,
        attribute,
        value,
    } = instruction
    else {
        return Err(mismatch(InstructionTag::Add));
    };
    let Some(uid) = replicated_uid(db, *entity) else {
        return Ok(None);
    };
    Ok(Some(WireInstruction::Add {
        seed: *seed,
        entity: uid,
        attribute: durable_attribute(db, *attribute)?,
        value: shared_value(db, *entity, value)?,
    }))
}

fn decode_add(_: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::Add {
        seed,
        entity,
        attribute,
        value,
    } = wire
    else {
        return Err(mismatch(InstructionTag::Add));
    };
    let attribute = decoder.resolver.attribute(decoder.db, attribute)?;
    let local = decoder
        .resolver
        .entity(decoder.db, *entity)
        .ok_or_else(|| unknown_entity(*entity))?;
    let value = decoder
        .resolver
        .value(decoder.db, value)?
        .ok_or_else(|| RippleError::UnknownEntity(format!("{:?}", value)))?;

    Ok(vec![Instruction::Add {
        seed: *seed,
        entity: local,
        attribute,
        value,
    }])
}

fn expand_add(_: &InstructionSet, _: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
    let Instruction::Add {
        entity,
        attribute,
        value,
        ..
    } = instruction
    else {
        return Err(mismatch(InstructionTag::Add));
    };
    Ok(vec![Op::assert(*entity, *attribute, value.clone())])
}

fn encode_remove(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::Remove {
        seed,
        entity,
        attribute,
        value,
    } = instruction
    else {
        return Err(mismatch(InstructionTag::Remove));
    };
    let Some(uid) = replicated_uid(db, *entity) else {
        return Ok(None);
    };
    Ok(Some(WireInstruction::Remove {
        seed: *seed,
        entity: uid,
        attribute: durable_attribute(db, *attribute)?,
        value: shared_value(db, *entity, value)?,
    }))
}

fn decode_remove(_: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::Remove {
        seed,
        entity,
        attribute,
        value,
    } = wire
    else {
        return Err(mismatch(InstructionTag::Remove));
    };
    let attribute = decoder.resolver.attribute(decoder.db, attribute)?;
    let Some(local) = decoder.resolver.entity(decoder.db, *entity) else {
        return Ok(Vec::new());
    };
    let Some(value) = decoder.resolver.value(decoder.db, value)? else {
        return Ok(Vec::new());
    };

    Ok(vec![Instruction::Remove {
        seed: *seed,
        entity: local,
        attribute,
        value,
    }])
}

fn expand_remove(_: &InstructionSet, _: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
    let Instruction::Remove {
        entity,
        attribute,
        value,
        ..
    } = instruction
    else {
        return Err(mismatch(InstructionTag::Remove));
    };
    Ok(vec![Op::retract(*entity, *attribute, value.clone())])
}

// RetractAttribute

fn encode_retract_attribute(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::RetractAttribute {
        seed,
        entity,
        attribute,
    } = instruction
    else {
        return Err(mismatch(InstructionTag::RetractAttribute));
    };
    let Some(uid) = replicated_uid(db, *entity) else {
        return Ok(None);
    };
    Ok(Some(WireInstruction::RetractAttribute {
        seed: *seed,
        entity: uid,
        attribute: durable_attribute(db, *attribute)?,
    }))
}

fn decode_retract_attribute(_: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::RetractAttribute {
        seed,
        entity,
        attribute,
    } = wire
    else {
        return Err(mismatch(InstructionTag::RetractAttribute));
    };
    let attribute = decoder.resolver.attribute(decoder.db, attribute)?;
    let Some(local) = decoder.resolver.entity(decoder.db, *entity) else {
        return Ok(Vec::new());
    };
    Ok(vec![Instruction::RetractAttribute {
        seed: *seed,
        entity: local,
        attribute,
    }])
}

fn expand_retract_attribute(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
    let Instruction::RetractAttribute {
        entity, attribute, ..
    } = instruction
    else {
        return Err(mismatch(InstructionTag::RetractAttribute));
    };
    Ok(db
        .get_many(*entity, *attribute)
        .into_iter()
        .map(|value| Op::retract(*entity, *attribute, value))
        .collect())
}

// RetractEntity

fn encode_retract_entity(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::RetractEntity { seed, entity } = instruction else {
        return Err(mismatch(InstructionTag::RetractEntity));
    };
    Ok(replicated_uid(db, *entity).map(|uid| WireInstruction::RetractEntity {
        seed: *seed,
        entity: uid,
    }))
}

fn decode_retract_entity(_: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::RetractEntity { seed, entity } = wire else {
        return Err(mismatch(InstructionTag::RetractEntity));
    };
    let Some(local) = decoder.resolver.entity(decoder.db, *entity) else {
        return Ok(Vec::new());
    };
    let instructions = decoder
        .db
        .cascade_set(local)
        .into_iter()
        .map(|entity| Instruction::RetractEntity { seed: *seed, entity })
        .collect();
    Ok(vec![Instruction::AtomicComposite {
        seed: *seed,
        instructions,
    }])
}

fn expand_retract_entity(_: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
    let Instruction::RetractEntity { entity, .. } = instruction else {
        return Err(mismatch(InstructionTag::RetractEntity));
    };
    Ok(db.retract_entity_ops(*entity))
}

// AtomicComposite

fn encode_composite(set: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::AtomicComposite { seed, instructions } = instruction else {
        return Err(mismatch(InstructionTag::AtomicComposite));
    };
    let mut wires = Vec::with_capacity(instructions.len());
    for child in instructions {
        if let Some(wire) = set.encode(db, child)? {
            wires.push(wire);
        }
    }
    if wires.iter().all(WireInstruction::is_validate) {
        return Ok(None);
    }
    Ok(Some(WireInstruction::AtomicComposite {
        seed: *seed,
        instructions: wires,
    }))
}

fn decode_composite(set: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::AtomicComposite { seed, instructions } = wire else {
        return Err(mismatch(InstructionTag::AtomicComposite));
    };
    let mut local = Vec::with_capacity(instructions.len());
    for child in instructions {
        local.extend(set.decode_with(decoder, child)?);
    }
    if local.is_empty() {
        return Ok(Vec::new());
    }
    Ok(vec![Instruction::AtomicComposite {
        seed: *seed,
        instructions: local,
    }])
}

fn expand_composite(set: &InstructionSet, db: &Db, instruction: &Instruction) -> RippleResult<Vec<Op>> {
    let Instruction::AtomicComposite { instructions, .. } = instruction else {
        return Err(mismatch(InstructionTag::AtomicComposite));
    };
    let mut ops = Vec::new();
    for child in instructions {
        ops.extend(set.expand(db, child)?);
    }
    Ok(ops)
}

// Validate

fn encode_validate(_: &InstructionSet, _: &Db, instruction: &Instruction) -> RippleResult<Option<WireInstruction>> {
    let Instruction::Validate { seed, queries, hash } = instruction else {
        return Err(mismatch(InstructionTag::Validate));
    };
    Ok(Some(WireInstruction::Validate {
        seed: *seed,
        queries: queries.clone(),
        hash: *hash,
    }))
}

fn decode_validate(_: &InstructionSet, decoder: &mut Decoder<'_>, wire: &WireInstruction) -> RippleResult<Vec<Instruction>> {
    let WireInstruction::Validate { seed, queries, hash } = wire else {
        return Err(mismatch(InstructionTag::Validate));
    };
    verify(decoder.db, *seed, queries, *hash)?;
    Ok(vec![Instruction::Validate {
        seed: *seed,
        queries: queries.clone(),
        hash: *hash,
    }])
}

fn expand_validate(_: &InstructionSet, _: &Db, _: &Instruction) -> RippleResult<Vec<Op>> {
    Ok(Vec::new())
}
