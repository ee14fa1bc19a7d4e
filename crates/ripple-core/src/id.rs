//! Identity types for the replication kernel
//!
//! Entity ids are 64-bit handles local to one fact store. The top byte holds
//! the partition so replication scope is known without a schema lookup.
//! Durable ids are uuids and survive serialization and reconnects.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id partition - controls replication scope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Partition {
    /// Replicated, canonical copy held by the kernel
    Shared = 0x01,
    /// Replicated, append-only (attributes and entity types)
    Schema = 0x02,
    /// Built-ins known to every store
    Common = 0x03,
    /// Frontend-only, never replicated
    Local = 0x04,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Shared,
        Partition::Schema,
        Partition::Common,
        Partition::Local,
    ];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Partition::Shared),
            0x02 => Some(Partition::Schema),
            0x03 => Some(Partition::Common),
            0x04 => Some(Partition::Local),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Slot of this partition in per-partition tables
    #[inline]
    pub fn slot(self) -> usize {
        (self as u8 - 1) as usize
    }

    /// Does the codec carry instructions targeting this partition?
    pub fn is_replicated(self) -> bool {
        matches!(self, Partition::Shared | Partition::Schema)
    }
}

const INDEX_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// Ephemeral entity handle - unique within one fact store
/// Format: \[partition:8\]\[index:56\]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub u64);

impl EntityId {
    #[inline]
    pub fn new(partition: Partition, index: u64) -> Self {
        EntityId(((partition.to_byte() as u64) << 56) | (index & INDEX_MASK))
    }

    /// Partition of this id. Ids with an unknown tag are treated as Local,
    /// which keeps them out of replication.
    #[inline]
    pub fn partition(self) -> Partition {
        Partition::from_byte((self.0 >> 56) as u8).unwrap_or(Partition::Local)
    }

    #[inline]
    pub fn index(self) -> u64 {
        self.0 & INDEX_MASK
    }

    #[inline]
    pub fn is_shared(self) -> bool {
        self.partition() == Partition::Shared
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({:?}:{:x})", self.partition(), self.index())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:014x}", self.partition().to_byte(), self.index())
    }
}

/// Durable identifier - stable across serialization and reconnects
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub Uuid);

impl Uid {
    pub fn generate() -> Self {
        Uid(Uuid::new_v4())
    }

    #[inline]
    pub fn from_u128(v: u128) -> Self {
        Uid(Uuid::from_u128(v))
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Uid)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client identity - origin of transactions
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uid);

impl ClientId {
    pub fn generate() -> Self {
        ClientId(Uid::generate())
    }

    #[inline]
    pub fn from_u128(v: u128) -> Self {
        ClientId(Uid::from_u128(v))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identity
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub Uid);

impl TxId {
    pub fn generate() -> Self {
        TxId(Uid::generate())
    }

    #[inline]
    pub fn from_u128(v: u128) -> Self {
        TxId(Uid::from_u128(v))
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tx({})", self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_partition_index() {
        let id = EntityId::new(Partition::Shared, 0x1234_5678);
        assert_eq!(id.partition(), Partition::Shared);
        assert_eq!(id.index(), 0x1234_5678);
        assert!(id.is_shared());
    }

    #[test]
    fn test_entity_id_index_truncation() {
        let id = EntityId::new(Partition::Local, u64::MAX);
        assert_eq!(id.partition(), Partition::Local);
        assert_eq!(id.index(), INDEX_MASK);
    }

    #[test]
    fn test_unknown_partition_is_local() {
        let id = EntityId(0x7700_0000_0000_0001);
        assert_eq!(id.partition(), Partition::Local);
        assert!(!id.partition().is_replicated());
    }

    #[test]
    fn test_partition_byte_roundtrip() {
        for p in Partition::ALL {
            assert_eq!(Partition::from_byte(p.to_byte()), Some(p));
        }
        assert_eq!(Partition::from_byte(0), None);
    }

    #[test]
    fn test_uid_parse_display() {
        let uid = Uid::from_u128(42);
        assert_eq!(Uid::parse(&uid.to_string()), Some(uid));
        assert_eq!(Uid::parse("not-a-uuid"), None);
    }
}
