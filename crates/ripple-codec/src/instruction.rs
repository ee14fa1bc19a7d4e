//! Local instructions
//!
//! Instructions address entities by ephemeral store ids. Each carries a
//! seed that baselines its read hash and tells replays apart.

use ripple_core::{EntityId, Uid, Value};
use ripple_wire::{DurableQuery, WireInstruction};

/// Instruction kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstructionTag {
    CreateEntity,
    Add,
    Remove,
    RetractAttribute,
    RetractEntity,
    AtomicComposite,
    Validate,
}

impl InstructionTag {
    pub const ALL: [InstructionTag; 7] = [
        InstructionTag::CreateEntity,
        InstructionTag::Add,
        InstructionTag::Remove,
        InstructionTag::RetractAttribute,
        InstructionTag::RetractEntity,
        InstructionTag::AtomicComposite,
        InstructionTag::Validate,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Tag of a wire instruction
    pub fn of_wire(wire: &WireInstruction) -> Self {
        match wire {
            WireInstruction::CreateEntity { .. } => InstructionTag::CreateEntity,
            WireInstruction::Add { .. } => InstructionTag::Add,
            WireInstruction::Remove { .. } => InstructionTag::Remove,
            WireInstruction::RetractAttribute { .. } => InstructionTag::RetractAttribute,
            WireInstruction::RetractEntity { .. } => InstructionTag::RetractEntity,
            WireInstruction::AtomicComposite { .. } => InstructionTag::AtomicComposite,
            WireInstruction::Validate { .. } => InstructionTag::Validate,
        }
    }
}

/// Local instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instruction {
    CreateEntity {
        seed: u64,
        entity: EntityId,
        entity_type: EntityId,
        /// Present for replicated entities
        uid: Option<Uid>,
        attributes: Vec<(EntityId, Value)>,
    },
    Add {
        seed: u64,
        entity: EntityId,
        attribute: EntityId,
        value: Value,
    },
    Remove {
        seed: u64,
        entity: EntityId,
        attribute: EntityId,
        value: Value,
    },
    RetractAttribute {
        seed: u64,
        entity: EntityId,
        attribute: EntityId,
    },
    /// Retracts the entity and everything that cascades with it
    RetractEntity { seed: u64, entity: EntityId },
    AtomicComposite {
        seed: u64,
        instructions: Vec<Instruction>,
    },
    /// Read-set assertion; queries are already durable
    Validate {
        seed: u64,
        queries: Vec<DurableQuery>,
        hash: u64,
    },
}

impl Instruction {
    pub fn tag(&self) -> InstructionTag {
        match self {
            Instruction::CreateEntity { .. } => InstructionTag::CreateEntity,
            Instruction::Add { .. } => InstructionTag::Add,
            Instruction::Remove { .. } => InstructionTag::Remove,
            Instruction::RetractAttribute { .. } => InstructionTag::RetractAttribute,
            Instruction::RetractEntity { .. } => InstructionTag::RetractEntity,
            Instruction::AtomicComposite { .. } => InstructionTag::AtomicComposite,
            Instruction::Validate { .. } => InstructionTag::Validate,
        }
    }

    pub fn seed(&self) -> u64 {
        match self {
            Instruction::CreateEntity { seed, .. }
            | Instruction::Add { seed, .. }
            | Instruction::Remove { seed, .. }
            | Instruction::RetractAttribute { seed, .. }
            | Instruction::RetractEntity { seed, .. }
            | Instruction::AtomicComposite { seed, .. }
            | Instruction::Validate { seed, .. } => *seed,
        }
    }

    /// Entity the instruction writes to
    pub fn target(&self) -> Option<EntityId> {
        match self {
            Instruction::CreateEntity { entity, .. }
            | Instruction::Add { entity, .. }
            | Instruction::Remove { entity, .. }
            | Instruction::RetractAttribute { entity, .. }
            | Instruction::RetractEntity { entity, .. } => Some(*entity),
            Instruction::AtomicComposite { .. } | Instruction::Validate { .. } => None,
        }
    }

    pub fn is_validate(&self) -> bool {
        matches!(self, Instruction::Validate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::Partition;

    #[test]
    fn test_tags_are_dense() {
        for (i, tag) in InstructionTag::ALL.iter().enumerate() {
            assert_eq!(tag.index(), i);
        }
    }

    #[test]
    fn test_target_and_seed() {
        let e = EntityId::new(Partition::Shared, 3);
        let add = Instruction::Add {
            seed: 11,
            entity: e,
            attribute: EntityId::new(Partition::Schema, 1),
            value: Value::Int(1),
        };
        assert_eq!(add.target(), Some(e));
        assert_eq!(add.seed(), 11);
        assert_eq!(add.tag(), InstructionTag::Add);

        let composite = Instruction::AtomicComposite {
            seed: 2,
            instructions: vec![add],
        };
        assert_eq!(composite.target(), None);
    }
}
