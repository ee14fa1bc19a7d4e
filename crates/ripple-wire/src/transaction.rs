//! Transactions and broadcasts

use serde::{Deserialize, Serialize};

use ripple_core::{ClientId, TxId};

use crate::WireInstruction;

/// Ordered group of wire instructions from one origin
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    pub instructions: Vec<WireInstruction>,
    pub origin: ClientId,
    /// Per-origin sequence number, starting at 1
    pub index: u64,
}

impl Transaction {
    pub fn new(origin: ClientId, index: u64, instructions: Vec<WireInstruction>) -> Self {
        Transaction {
            id: TxId::generate(),
            instructions,
            origin,
            index,
        }
    }

    /// Copy with read validations stripped, as relayed to other clients
    pub fn without_validations(&self) -> Transaction {
        Transaction {
            id: self.id,
            instructions: self
                .instructions
                .iter()
                .filter_map(WireInstruction::without_validations)
                .collect(),
            origin: self.origin,
            index: self.index,
        }
    }
}

/// Kernel → client stream item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Broadcast {
    /// Another origin's transaction was applied
    Tx(Transaction),
    /// Own transaction applied
    Ack(TxId),
    /// Transaction failed to apply (any origin)
    Failure(ClientId, TxId),
    /// Own transaction rejected on stale reads
    Rejection(TxId),
    /// Connection must be re-established from a fresh snapshot
    Reset,
}

impl Broadcast {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Broadcast::Tx(_) => "tx",
            Broadcast::Ack(_) => "ack",
            Broadcast::Failure(..) => "failure",
            Broadcast::Rejection(_) => "rejection",
            Broadcast::Reset => "reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DurableQuery, WireInstruction};
    use ripple_core::Uid;

    #[test]
    fn test_transaction_strip_keeps_identity() {
        let origin = ClientId::from_u128(1);
        let tx = Transaction::new(
            origin,
            3,
            vec![
                WireInstruction::RetractEntity {
                    seed: 1,
                    entity: Uid::from_u128(5),
                },
                WireInstruction::Validate {
                    seed: 1,
                    queries: vec![DurableQuery::RefsTo {
                        target: Uid::from_u128(5),
                    }],
                    hash: 1,
                },
            ],
        );

        let stripped = tx.without_validations();
        assert_eq!(stripped.id, tx.id);
        assert_eq!(stripped.index, 3);
        assert_eq!(stripped.instructions.len(), 1);
    }

    #[test]
    fn test_broadcast_json() {
        let b = Broadcast::Failure(ClientId::from_u128(1), TxId::from_u128(2));
        let json = serde_json::to_string(&b).unwrap();
        let back: Broadcast = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
        assert_eq!(Broadcast::Reset.kind(), "reset");
    }
}
